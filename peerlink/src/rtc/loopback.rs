//! In-memory peer connection backend.
//!
//! Every [`LoopbackRtc`] handed out by one [`LoopbackNetwork`] can reach
//! every other. Session descriptions are tokens naming the endpoint that
//! produced them, so an answer only applies to the offer it was created
//! for. The offering side's channel opens on both ends as soon as the
//! answer is applied. Tests can hold messages in flight and sever every
//! connection to exercise failure paths.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use peerlink_proto::envelope::IceCandidate;

use super::{
    CHANNEL_LABEL, ConnectionState, DataChannel, EventSink, PeerConnection, RtcApi, RtcError,
    RtcEventKind, SignalingState,
};

const OFFER_PREFIX: &str = "loopback-offer:";
const ANSWER_PREFIX: &str = "loopback-answer:";

type Shared = Arc<Mutex<Net>>;

/// A shared in-memory network.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    net: Shared,
}

/// Backend handle for one client on a [`LoopbackNetwork`].
#[derive(Debug, Clone)]
pub struct LoopbackRtc {
    net: Shared,
}

/// A connection on the loopback network.
#[derive(Debug)]
pub struct LoopbackConnection {
    uid: u64,
    net: Shared,
}

/// One end of an open loopback channel.
#[derive(Debug)]
pub struct LoopbackChannel {
    uid: u64,
    net: Shared,
}

#[derive(Debug, Default)]
struct Net {
    next_uid: u64,
    endpoints: HashMap<u64, Endpoint>,
    paused: bool,
    held: Vec<(u64, String)>,
}

#[derive(Debug)]
struct Endpoint {
    sink: EventSink,
    signaling: SignalingState,
    partner: Option<u64>,
    has_remote_description: bool,
    wants_channel: bool,
    channel_open: bool,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a backend attached to this network.
    #[must_use]
    pub fn endpoint(&self) -> LoopbackRtc {
        LoopbackRtc {
            net: Arc::clone(&self.net),
        }
    }

    /// Holds channel messages in flight until [`resume_delivery`] is called.
    ///
    /// [`resume_delivery`]: Self::resume_delivery
    pub fn pause_delivery(&self) {
        self.net.lock().paused = true;
    }

    /// Delivers held messages whose channel is still open.
    pub fn resume_delivery(&self) {
        let mut net = self.net.lock();
        net.paused = false;
        for (uid, text) in std::mem::take(&mut net.held) {
            if let Some(endpoint) = net.endpoints.get(&uid).filter(|e| e.channel_open) {
                endpoint.sink.emit(RtcEventKind::ChannelMessage(text));
            }
        }
    }

    /// Fails every live connection, as if the network path disappeared.
    pub fn sever_all(&self) {
        let mut net = self.net.lock();
        net.held.clear();
        for endpoint in net.endpoints.values_mut() {
            if endpoint.signaling == SignalingState::Closed {
                continue;
            }
            endpoint.signaling = SignalingState::Closed;
            if std::mem::take(&mut endpoint.channel_open) {
                endpoint.sink.emit(RtcEventKind::ChannelClosed);
            }
            endpoint
                .sink
                .emit(RtcEventKind::ConnectionState(ConnectionState::Failed));
        }
    }

    /// Number of channel ends currently open.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.net
            .lock()
            .endpoints
            .values()
            .filter(|e| e.channel_open)
            .count()
    }

    /// Number of messages held by [`pause_delivery`](Self::pause_delivery).
    #[must_use]
    pub fn held_messages(&self) -> usize {
        self.net.lock().held.len()
    }
}

impl RtcApi for LoopbackRtc {
    type Connection = LoopbackConnection;

    async fn new_connection(&self, sink: EventSink) -> Result<LoopbackConnection, RtcError> {
        let mut net = self.net.lock();
        net.next_uid += 1;
        let uid = net.next_uid;
        net.endpoints.insert(
            uid,
            Endpoint {
                sink,
                signaling: SignalingState::Stable,
                partner: None,
                has_remote_description: false,
                wants_channel: false,
                channel_open: false,
            },
        );
        Ok(LoopbackConnection {
            uid,
            net: Arc::clone(&self.net),
        })
    }
}

impl Net {
    fn endpoint_mut(&mut self, uid: u64) -> Result<&mut Endpoint, RtcError> {
        match self.endpoints.get_mut(&uid) {
            Some(endpoint) if endpoint.signaling != SignalingState::Closed => Ok(endpoint),
            _ => Err(RtcError::Closed),
        }
    }

    fn expect_state(
        &mut self,
        uid: u64,
        expected: SignalingState,
    ) -> Result<&mut Endpoint, RtcError> {
        let endpoint = self.endpoint_mut(uid)?;
        if endpoint.signaling == expected {
            Ok(endpoint)
        } else {
            Err(RtcError::InvalidState(endpoint.signaling))
        }
    }

    /// Marks both ends of `uid`'s channel closed and tells each side.
    fn close_channel(&mut self, uid: u64) {
        let partner = self.endpoints.get(&uid).and_then(|e| e.partner);
        for end in std::iter::once(uid).chain(partner) {
            if let Some(endpoint) = self.endpoints.get_mut(&end) {
                if std::mem::take(&mut endpoint.channel_open) {
                    endpoint.sink.emit(RtcEventKind::ChannelClosed);
                }
            }
        }
    }
}

fn parse_description(sdp: &str, prefix: &str) -> Result<u64, RtcError> {
    sdp.strip_prefix(prefix)
        .and_then(|uid| uid.parse().ok())
        .ok_or_else(|| RtcError::InvalidDescription(sdp.to_string()))
}

fn local_candidate(uid: u64) -> IceCandidate {
    let mut candidate = IceCandidate::new(format!("candidate:loopback {uid}"));
    candidate.sdp_mid = Some("0".to_string());
    candidate.sdp_mline_index = Some(0);
    candidate
}

impl LoopbackConnection {
    fn with_net<T>(
        &self,
        f: impl FnOnce(&mut Net, u64) -> Result<T, RtcError>,
    ) -> Result<T, RtcError> {
        f(&mut self.net.lock(), self.uid)
    }
}

impl PeerConnection for LoopbackConnection {
    async fn create_channel(&self) -> Result<(), RtcError> {
        self.with_net(|net, uid| {
            net.endpoint_mut(uid)?.wants_channel = true;
            Ok(())
        })
    }

    async fn create_offer(&self) -> Result<String, RtcError> {
        self.with_net(|net, uid| {
            let endpoint = net.expect_state(uid, SignalingState::Stable)?;
            endpoint.signaling = SignalingState::HaveLocalOffer;
            endpoint
                .sink
                .emit(RtcEventKind::LocalCandidate(local_candidate(uid)));
            Ok(format!("{OFFER_PREFIX}{uid}"))
        })
    }

    async fn set_remote_offer(&self, sdp: String) -> Result<(), RtcError> {
        self.with_net(|net, uid| {
            let offerer = parse_description(&sdp, OFFER_PREFIX)?;
            if !net.endpoints.contains_key(&offerer) {
                return Err(RtcError::InvalidDescription(sdp));
            }
            let endpoint = net.expect_state(uid, SignalingState::Stable)?;
            endpoint.partner = Some(offerer);
            endpoint.has_remote_description = true;
            endpoint.signaling = SignalingState::HaveRemoteOffer;
            Ok(())
        })
    }

    async fn create_answer(&self) -> Result<String, RtcError> {
        self.with_net(|net, uid| {
            let endpoint = net.expect_state(uid, SignalingState::HaveRemoteOffer)?;
            endpoint.signaling = SignalingState::Stable;
            endpoint
                .sink
                .emit(RtcEventKind::LocalCandidate(local_candidate(uid)));
            Ok(format!("{ANSWER_PREFIX}{uid}"))
        })
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<(), RtcError> {
        let net = Arc::clone(&self.net);
        self.with_net(|state, uid| {
            let answerer = parse_description(&sdp, ANSWER_PREFIX)?;
            let answers_us = state
                .endpoints
                .get(&answerer)
                .is_some_and(|e| e.partner == Some(uid));
            if !answers_us {
                return Err(RtcError::InvalidDescription(sdp));
            }
            let endpoint = state.expect_state(uid, SignalingState::HaveLocalOffer)?;
            endpoint.partner = Some(answerer);
            endpoint.has_remote_description = true;
            endpoint.signaling = SignalingState::Stable;
            if endpoint.wants_channel {
                for own in [uid, answerer] {
                    if let Some(end) = state.endpoints.get_mut(&own) {
                        end.channel_open = true;
                        end.sink.emit(RtcEventKind::ChannelOpen(Arc::new(LoopbackChannel {
                            uid: own,
                            net: Arc::clone(&net),
                        })));
                    }
                }
            }
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.with_net(|net, uid| {
            let endpoint = net.endpoint_mut(uid)?;
            if !candidate.candidate.starts_with("candidate:") {
                return Err(RtcError::InvalidCandidate(candidate.candidate));
            }
            if !endpoint.has_remote_description {
                return Err(RtcError::InvalidState(endpoint.signaling));
            }
            Ok(())
        })
    }

    fn signaling_state(&self) -> SignalingState {
        self.net
            .lock()
            .endpoints
            .get(&self.uid)
            .map_or(SignalingState::Closed, |e| e.signaling)
    }

    async fn close(&self) {
        let mut net = self.net.lock();
        let Ok(endpoint) = net.endpoint_mut(self.uid) else {
            return;
        };
        endpoint.signaling = SignalingState::Closed;
        let partner = endpoint.partner;
        net.close_channel(self.uid);
        if let Some(remote) = partner.and_then(|p| net.endpoints.get(&p)) {
            if remote.signaling != SignalingState::Closed {
                remote
                    .sink
                    .emit(RtcEventKind::ConnectionState(ConnectionState::Closed));
            }
        }
    }
}

impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        CHANNEL_LABEL
    }

    fn send_text(&self, text: String) -> Result<(), RtcError> {
        let mut net = self.net.lock();
        let partner = match net.endpoints.get(&self.uid) {
            Some(endpoint) if endpoint.channel_open => endpoint.partner,
            _ => None,
        };
        let Some(partner) = partner.filter(|p| net.endpoints.get(p).is_some_and(|e| e.channel_open))
        else {
            return Err(RtcError::Closed);
        };
        if net.paused {
            net.held.push((partner, text));
        } else if let Some(remote) = net.endpoints.get(&partner) {
            remote.sink.emit(RtcEventKind::ChannelMessage(text));
        }
        Ok(())
    }

    fn close(&self) {
        self.net.lock().close_channel(self.uid);
    }
}
