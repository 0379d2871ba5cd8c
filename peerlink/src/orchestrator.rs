//! Direct-link negotiation.
//!
//! The orchestrator owns at most one [`PeerLink`] per remote peer and moves
//! it through offer/answer to an open data channel:
//!
//! ```text
//!  (none) --connect--> Offering --answer applied, channel open--> Connected
//!  (none) --offer-->   Answering --channel open-----------------> Connected
//!  any    --failed / closed / channel closed / disconnect------> (none)
//! ```
//!
//! Operations return the signaling envelope to publish (if any) instead of
//! sending it, so the caller decides how it reaches the relay. After every
//! await the link is looked up again: if it was removed or replaced while
//! the backend was working, the result is discarded.

use std::collections::HashMap;
use std::sync::Arc;

use peerlink_proto::envelope::{Envelope, IceCandidate};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::peers::PeerId;
use crate::rtc::{
    DataChannel, EventSink, LinkId, PeerConnection, RtcApi, RtcError, RtcEvent, RtcEventKind,
    SignalingState,
};

/// Negotiation progress of a link.
#[derive(Debug, Clone)]
pub enum LinkState {
    /// We sent an offer and are waiting for the channel.
    Offering,
    /// We answered an offer and are waiting for the channel.
    Answering,
    /// The data channel is open.
    Connected {
        /// The open channel.
        channel: Arc<dyn DataChannel>,
    },
}

/// A [`LinkState`] without the channel, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Offer sent.
    Offering,
    /// Answer sent.
    Answering,
    /// Channel open.
    Connected,
}

impl From<&LinkState> for LinkStatus {
    fn from(state: &LinkState) -> Self {
        match state {
            LinkState::Offering => Self::Offering,
            LinkState::Answering => Self::Answering,
            LinkState::Connected { .. } => Self::Connected,
        }
    }
}

/// Per-peer negotiation record.
#[derive(Debug)]
struct PeerLink<C> {
    id: LinkId,
    state: LinkState,
    connection: Arc<C>,
}

/// What the caller should do after an [`RtcEvent`].
#[derive(Debug)]
pub enum LinkUpdate {
    /// Nothing to do.
    None,
    /// Publish this signaling envelope through the relay.
    Outbound(Envelope),
    /// The channel to this peer opened.
    Opened(PeerId),
    /// The link to this peer is gone. Pending direct probes must be canceled.
    Closed(PeerId),
    /// Text arrived on the channel.
    Message {
        /// Sending peer.
        peer: PeerId,
        /// Raw channel payload.
        text: String,
    },
}

/// Result of [`Orchestrator::handle_offer`].
#[derive(Debug)]
pub struct OfferOutcome {
    /// An open link to the peer was torn down to take the offer. Pending
    /// direct probes on it must be canceled.
    pub replaced: bool,
    /// The answer to publish, `None` if the offer was dropped, or the error
    /// that ended the negotiation.
    pub answer: Result<Option<Envelope>, RtcError>,
}

/// Owns every direct link and drives their negotiation.
pub struct Orchestrator<R: RtcApi> {
    api: R,
    events: mpsc::UnboundedSender<RtcEvent>,
    links: HashMap<PeerId, PeerLink<R::Connection>>,
    next_link: u64,
}

impl<R: RtcApi> std::fmt::Debug for Orchestrator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("links", &self.statuses())
            .finish_non_exhaustive()
    }
}

impl<R: RtcApi> Orchestrator<R> {
    /// Creates an orchestrator whose links post events to `events`.
    pub fn new(api: R, events: mpsc::UnboundedSender<RtcEvent>) -> Self {
        Self {
            api,
            events,
            links: HashMap::new(),
            next_link: 0,
        }
    }

    /// Returns `true` if any link (in any state) exists for `peer`.
    #[must_use]
    pub fn has_link(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    /// Returns `true` if the channel to `peer` is open.
    #[must_use]
    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.channel(peer).is_some()
    }

    /// Status of the link to `peer`.
    #[must_use]
    pub fn status(&self, peer: &PeerId) -> Option<LinkStatus> {
        self.links.get(peer).map(|link| LinkStatus::from(&link.state))
    }

    /// Status of every link, ordered by peer id.
    #[must_use]
    pub fn statuses(&self) -> Vec<(PeerId, LinkStatus)> {
        let mut out: Vec<_> = self
            .links
            .iter()
            .map(|(peer, link)| (peer.clone(), LinkStatus::from(&link.state)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Sends `text` over the open channel to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`RtcError::NoChannel`] if no channel is open, or the
    /// channel's own error if the send fails.
    pub fn send(&self, peer: &PeerId, text: String) -> Result<(), RtcError> {
        self.channel(peer)
            .ok_or_else(|| RtcError::NoChannel(peer.clone()))?
            .send_text(text)
    }

    /// Starts negotiating with `peer` as the offering side.
    ///
    /// Returns the offer to publish, or `None` if a link already exists or
    /// was torn down while the offer was being created.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the connection, channel, or offer could
    /// not be created. The half-built link is removed.
    pub async fn connect(&mut self, peer: &PeerId) -> Result<Option<Envelope>, RtcError> {
        if self.links.contains_key(peer) {
            return Ok(None);
        }
        let id = self.insert_link(peer, LinkState::Offering).await?;
        let Some(connection) = self.current(peer, id) else {
            return Ok(None);
        };

        if let Err(e) = connection.create_channel().await {
            self.fail(peer, id).await;
            return Err(e);
        }
        if self.current(peer, id).is_none() {
            return Ok(None);
        }

        let sdp = match connection.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                self.fail(peer, id).await;
                return Err(e);
            }
        };
        if self.current(peer, id).is_none() {
            return Ok(None);
        }

        info!(%peer, link = %id, "offering direct link");
        Ok(Some(Envelope::offer(peer.as_str(), sdp)))
    }

    /// Handles an offer addressed to us.
    ///
    /// An offer that arrives while our own offer to the same peer is still
    /// outstanding (signaling not stable) is dropped. Otherwise the link is
    /// created, or reused if one exists in a stable state. An open link is
    /// torn down first and the outcome says so, because nothing on the old
    /// link will report its close.
    ///
    /// A failed negotiation removes the link and is returned in
    /// [`OfferOutcome::answer`].
    pub async fn handle_offer(&mut self, peer: &PeerId, sdp: String) -> OfferOutcome {
        let replaced = match self.links.get(peer) {
            Some(link) => {
                let signaling = link.connection.signaling_state();
                if signaling != SignalingState::Stable {
                    warn!(%peer, %signaling, "dropping offer while negotiation is in progress");
                    return OfferOutcome {
                        replaced: false,
                        answer: Ok(None),
                    };
                }
                matches!(link.state, LinkState::Connected { .. })
            }
            None => false,
        };
        if replaced {
            // The peer restarted its side; start over.
            debug!(%peer, "replacing connected link on new offer");
            self.remove(peer).await;
        }
        OfferOutcome {
            replaced,
            answer: self.answer_offer(peer, sdp).await,
        }
    }

    async fn answer_offer(
        &mut self,
        peer: &PeerId,
        sdp: String,
    ) -> Result<Option<Envelope>, RtcError> {
        let id = match self.links.get_mut(peer) {
            Some(link) => {
                link.state = LinkState::Answering;
                link.id
            }
            None => self.insert_link(peer, LinkState::Answering).await?,
        };
        let Some(connection) = self.current(peer, id) else {
            return Ok(None);
        };

        if let Err(e) = connection.set_remote_offer(sdp).await {
            self.fail(peer, id).await;
            return Err(e);
        }
        if self.current(peer, id).is_none() {
            return Ok(None);
        }

        let answer = match connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(peer, id).await;
                return Err(e);
            }
        };
        if self.current(peer, id).is_none() {
            return Ok(None);
        }

        info!(%peer, link = %id, "answering direct link");
        Ok(Some(Envelope::answer(peer.as_str(), answer)))
    }

    /// Handles an answer addressed to us. Answers for peers we are not
    /// offering to are ignored.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the answer cannot be applied. The link
    /// is removed.
    pub async fn handle_answer(&mut self, peer: &PeerId, sdp: String) -> Result<(), RtcError> {
        let Some(link) = self.links.get(peer) else {
            debug!(%peer, "ignoring answer without a link");
            return Ok(());
        };
        if !matches!(link.state, LinkState::Offering) {
            debug!(%peer, "ignoring answer for a link we did not offer");
            return Ok(());
        }
        let (id, connection) = (link.id, Arc::clone(&link.connection));

        if let Err(e) = connection.set_remote_answer(sdp).await {
            self.fail(peer, id).await;
            return Err(e);
        }
        Ok(())
    }

    /// Applies a candidate trickled by `peer`.
    ///
    /// Candidates for a peer with no link are dropped. A candidate the
    /// backend rejects leaves the link untouched.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the candidate could not be applied.
    pub async fn handle_candidate(
        &mut self,
        peer: &PeerId,
        candidate: IceCandidate,
    ) -> Result<(), RtcError> {
        let Some(link) = self.links.get(peer) else {
            debug!(%peer, "dropping candidate without a link");
            return Ok(());
        };
        let connection = Arc::clone(&link.connection);
        connection.add_ice_candidate(candidate).await
    }

    /// Folds a backend event into link state.
    ///
    /// Events from links that have since been removed or replaced are
    /// ignored (a stale channel is closed).
    pub async fn on_rtc_event(&mut self, event: RtcEvent) -> LinkUpdate {
        let RtcEvent { peer, link, kind } = event;
        let Some(current) = self.links.get_mut(&peer).filter(|l| l.id == link) else {
            if let RtcEventKind::ChannelOpen(channel) = kind {
                channel.close();
            }
            debug!(%peer, %link, "ignoring event from a stale link");
            return LinkUpdate::None;
        };

        match kind {
            RtcEventKind::LocalCandidate(candidate) => {
                LinkUpdate::Outbound(Envelope::ice_candidate(peer.as_str(), candidate))
            }
            RtcEventKind::ChannelOpen(channel) => {
                if matches!(current.state, LinkState::Connected { .. }) {
                    debug!(%peer, label = channel.label(), "closing duplicate channel");
                    channel.close();
                    return LinkUpdate::None;
                }
                current.state = LinkState::Connected { channel };
                info!(%peer, %link, "direct channel open");
                LinkUpdate::Opened(peer)
            }
            RtcEventKind::ChannelMessage(text) => LinkUpdate::Message { peer, text },
            RtcEventKind::ChannelClosed | RtcEventKind::ConnectionState(_) => {
                info!(%peer, %link, "direct link ended");
                self.remove(&peer).await;
                LinkUpdate::Closed(peer)
            }
        }
    }

    /// Tears down the link to `peer`. Returns `true` if one existed.
    pub async fn disconnect(&mut self, peer: &PeerId) -> bool {
        self.remove(peer).await
    }

    /// Tears down every link.
    pub async fn close_all(&mut self) {
        let peers: Vec<_> = self.links.keys().cloned().collect();
        for peer in peers {
            self.remove(&peer).await;
        }
    }

    fn channel(&self, peer: &PeerId) -> Option<&Arc<dyn DataChannel>> {
        match &self.links.get(peer)?.state {
            LinkState::Connected { channel } => Some(channel),
            _ => None,
        }
    }

    /// The connection of `peer`'s link if it is still link `id`.
    fn current(&self, peer: &PeerId, id: LinkId) -> Option<Arc<R::Connection>> {
        self.links
            .get(peer)
            .filter(|link| link.id == id)
            .map(|link| Arc::clone(&link.connection))
    }

    async fn insert_link(&mut self, peer: &PeerId, state: LinkState) -> Result<LinkId, RtcError> {
        self.next_link += 1;
        let id = LinkId::from_raw(self.next_link);
        let sink = EventSink::new(peer.clone(), id, self.events.clone());
        let connection = self.api.new_connection(sink).await?;
        self.links.insert(
            peer.clone(),
            PeerLink {
                id,
                state,
                connection: Arc::new(connection),
            },
        );
        Ok(id)
    }

    /// Removes link `id` after a negotiation step failed.
    async fn fail(&mut self, peer: &PeerId, id: LinkId) {
        if self.current(peer, id).is_some() {
            self.remove(peer).await;
        }
    }

    async fn remove(&mut self, peer: &PeerId) -> bool {
        let Some(link) = self.links.remove(peer) else {
            return false;
        };
        if let LinkState::Connected { channel } = &link.state {
            channel.close();
        }
        link.connection.close().await;
        true
    }
}
