//! Peer connection backends.
//!
//! The orchestrator drives negotiation through the [`RtcApi`] /
//! [`PeerConnection`] / [`DataChannel`] traits and learns about asynchronous
//! happenings (trickled candidates, channel open/close, messages) through
//! [`RtcEvent`]s posted on a single channel. Two backends exist:
//!
//! - [`native::WebRtcApi`]: the `webrtc` crate, for real peers.
//! - [`loopback::LoopbackNetwork`]: in-memory, for tests.

pub mod loopback;
pub mod native;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use peerlink_proto::envelope::IceCandidate;
use tokio::sync::mpsc;

use crate::peers::PeerId;

/// Label of the single data channel opened per link.
pub const CHANNEL_LABEL: &str = "peerlink";

/// Errors reported by a backend.
#[derive(Debug, thiserror::Error)]
pub enum RtcError {
    /// The connection or channel has been closed.
    #[error("connection closed")]
    Closed,

    /// No open data channel to the peer.
    #[error("no open channel to {0}")]
    NoChannel(PeerId),

    /// The session description could not be applied.
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    /// The candidate could not be applied.
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// The operation is not allowed in the current signaling state.
    #[error("not allowed in signaling state {0}")]
    InvalidState(SignalingState),

    /// Any other failure inside the backend.
    #[error("rtc backend: {0}")]
    Backend(String),
}

/// Offer/answer state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// No exchange in progress.
    Stable,
    /// A local offer has been applied; waiting for the answer.
    HaveLocalOffer,
    /// A remote offer has been applied; the answer is not yet created.
    HaveRemoteOffer,
    /// Provisional answers are in play.
    Provisional,
    /// The connection is closed.
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Provisional => "provisional",
            Self::Closed => "closed",
        })
    }
}

/// Terminal transport states that end a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connectivity was lost for good.
    Failed,
    /// The connection was closed.
    Closed,
}

/// Identifies one negotiation attempt with a peer.
///
/// Events carry the id of the link they were produced for, so events from a
/// torn-down link can be told apart from events for its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    /// Wraps a raw link number.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Something a backend observed on a link.
#[derive(Debug)]
pub enum RtcEventKind {
    /// A local candidate to trickle to the peer.
    LocalCandidate(IceCandidate),
    /// A data channel opened (locally created or announced by the peer).
    ChannelOpen(Arc<dyn DataChannel>),
    /// Text arrived on the data channel.
    ChannelMessage(String),
    /// The data channel closed.
    ChannelClosed,
    /// The connection reached a terminal state.
    ConnectionState(ConnectionState),
}

/// An [`RtcEventKind`] tagged with the link it belongs to.
#[derive(Debug)]
pub struct RtcEvent {
    /// Remote peer of the link.
    pub peer: PeerId,
    /// Link that produced the event.
    pub link: LinkId,
    /// What happened.
    pub kind: RtcEventKind,
}

/// Posts events for one link. Cheap to clone into backend callbacks.
#[derive(Debug, Clone)]
pub struct EventSink {
    peer: PeerId,
    link: LinkId,
    tx: mpsc::UnboundedSender<RtcEvent>,
}

impl EventSink {
    /// Creates a sink tagging every event with `peer` and `link`.
    #[must_use]
    pub const fn new(peer: PeerId, link: LinkId, tx: mpsc::UnboundedSender<RtcEvent>) -> Self {
        Self { peer, link, tx }
    }

    /// Remote peer of the link.
    #[must_use]
    pub const fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Link the sink belongs to.
    #[must_use]
    pub const fn link(&self) -> LinkId {
        self.link
    }

    /// Posts an event. Dropped silently once the client has shut down.
    pub fn emit(&self, kind: RtcEventKind) {
        let _ = self.tx.send(RtcEvent {
            peer: self.peer.clone(),
            link: self.link,
            kind,
        });
    }
}

/// Factory for peer connections.
pub trait RtcApi: Send + Sync + 'static {
    /// Connection type produced by this backend.
    type Connection: PeerConnection;

    /// Creates a fresh connection whose events are posted to `sink`.
    fn new_connection(
        &self,
        sink: EventSink,
    ) -> impl Future<Output = Result<Self::Connection, RtcError>> + Send;
}

/// One peer connection, negotiated through offer/answer and trickled
/// candidates.
pub trait PeerConnection: Send + Sync + 'static {
    /// Creates the outbound data channel. Called by the offering side only;
    /// the answering side learns about the channel through
    /// [`RtcEventKind::ChannelOpen`].
    fn create_channel(&self) -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Creates and applies a local offer, returning its SDP.
    fn create_offer(&self) -> impl Future<Output = Result<String, RtcError>> + Send;

    /// Applies a remote offer.
    fn set_remote_offer(&self, sdp: String) -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Creates and applies a local answer, returning its SDP.
    fn create_answer(&self) -> impl Future<Output = Result<String, RtcError>> + Send;

    /// Applies a remote answer.
    fn set_remote_answer(&self, sdp: String)
    -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Applies a candidate trickled by the peer.
    fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> impl Future<Output = Result<(), RtcError>> + Send;

    /// Current offer/answer state.
    fn signaling_state(&self) -> SignalingState;

    /// Closes the connection and its channel.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// An open, ordered, reliable text channel to a peer.
pub trait DataChannel: Send + Sync + fmt::Debug {
    /// Channel label.
    fn label(&self) -> &str;

    /// Queues `text` for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`RtcError::Closed`] once the channel has closed.
    fn send_text(&self, text: String) -> Result<(), RtcError>;

    /// Closes the channel.
    fn close(&self);
}
