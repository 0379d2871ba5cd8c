//! WebRTC backend built on the `webrtc` crate.
//!
//! Candidates are trickled: each one is posted as it is gathered instead of
//! waiting for gathering to finish and embedding them in the description.

use std::sync::Arc;

use peerlink_proto::envelope::IceCandidate;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::{
    CHANNEL_LABEL, ConnectionState, DataChannel, EventSink, PeerConnection, RtcApi, RtcError,
    RtcEventKind, SignalingState,
};

#[allow(clippy::needless_pass_by_value)]
fn backend(e: webrtc::Error) -> RtcError {
    RtcError::Backend(e.to_string())
}

/// Factory for `webrtc` peer connections.
pub struct WebRtcApi {
    api: API,
    stun_servers: Vec<String>,
}

impl std::fmt::Debug for WebRtcApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcApi")
            .field("stun_servers", &self.stun_servers)
            .finish_non_exhaustive()
    }
}

impl WebRtcApi {
    /// Builds the media engine and interceptor stack.
    ///
    /// # Errors
    ///
    /// Returns [`RtcError::Backend`] if the default codecs or interceptors
    /// cannot be registered.
    pub fn new(stun_servers: Vec<String>) -> Result<Self, RtcError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(backend)?;
        let registry = register_default_interceptors(Registry::new(), &mut media).map_err(backend)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, stun_servers })
    }
}

impl RtcApi for WebRtcApi {
    type Connection = WebRtcConnection;

    async fn new_connection(&self, sink: EventSink) -> Result<WebRtcConnection, RtcError> {
        let config = RTCConfiguration {
            ice_servers: self
                .stun_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(backend)?);
        install_handlers(&pc, &sink);
        Ok(WebRtcConnection { pc, sink })
    }
}

/// Registers the connection-level callbacks. Work happens inside the
/// returned futures.
fn install_handlers(pc: &RTCPeerConnection, sink: &EventSink) {
    let candidates = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(RtcEventKind::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => warn!(peer = %sink.peer(), error = %e, "unserializable local candidate"),
            }
        })
    }));

    let states = sink.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = states.clone();
        Box::pin(async move {
            debug!(peer = %sink.peer(), link = %sink.link(), ?state, "peer connection state");
            let terminal = match state {
                RTCPeerConnectionState::Failed => ConnectionState::Failed,
                RTCPeerConnectionState::Closed => ConnectionState::Closed,
                _ => return,
            };
            sink.emit(RtcEventKind::ConnectionState(terminal));
        })
    }));

    let channels = sink.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let sink = channels.clone();
        Box::pin(async move {
            info!(peer = %sink.peer(), label = dc.label(), "remote data channel announced");
            wire_channel(dc, sink);
        })
    }));
}

/// Forwards a data channel's open/message/close callbacks to `sink`.
fn wire_channel(dc: Arc<RTCDataChannel>, sink: EventSink) {
    let handle: Arc<dyn DataChannel> = Arc::new(WebRtcChannel::new(Arc::clone(&dc)));

    let on_open = sink.clone();
    dc.on_open(Box::new(move || {
        let sink = on_open.clone();
        let handle = Arc::clone(&handle);
        Box::pin(async move {
            sink.emit(RtcEventKind::ChannelOpen(handle));
        })
    }));

    let on_message = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = on_message.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => sink.emit(RtcEventKind::ChannelMessage(text)),
                Err(_) => debug!(peer = %sink.peer(), "dropping non-UTF-8 channel message"),
            }
        })
    }));

    dc.on_close(Box::new(move || {
        let sink = sink.clone();
        Box::pin(async move {
            sink.emit(RtcEventKind::ChannelClosed);
        })
    }));
}

/// A `webrtc` peer connection.
pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    sink: EventSink,
}

impl PeerConnection for WebRtcConnection {
    async fn create_channel(&self) -> Result<(), RtcError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(CHANNEL_LABEL, Some(init))
            .await
            .map_err(backend)?;
        wire_channel(dc, self.sink.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, RtcError> {
        let offer = self.pc.create_offer(None).await.map_err(backend)?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await.map_err(backend)?;
        Ok(sdp)
    }

    async fn set_remote_offer(&self, sdp: String) -> Result<(), RtcError> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| RtcError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| RtcError::InvalidDescription(e.to_string()))
    }

    async fn create_answer(&self) -> Result<String, RtcError> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await.map_err(backend)?;
        Ok(sdp)
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<(), RtcError> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| RtcError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| RtcError::InvalidDescription(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| RtcError::InvalidCandidate(e.to_string()))
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Provisional,
        }
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(peer = %self.sink.peer(), error = %e, "error closing peer connection");
        }
    }
}

/// Sending half of a `webrtc` data channel.
///
/// Sends are queued and written by a pump task so callers never await.
pub struct WebRtcChannel {
    label: String,
    outbound: mpsc::UnboundedSender<String>,
    dc: Arc<RTCDataChannel>,
}

impl std::fmt::Debug for WebRtcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcChannel")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl WebRtcChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        let (outbound, mut queue) = mpsc::unbounded_channel::<String>();
        let pump = Arc::clone(&dc);
        tokio::spawn(async move {
            while let Some(text) = queue.recv().await {
                if let Err(e) = pump.send_text(text).await {
                    warn!(label = pump.label(), error = %e, "data channel send failed");
                    break;
                }
            }
        });
        Self {
            label: dc.label().to_string(),
            outbound,
            dc,
        }
    }
}

impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send_text(&self, text: String) -> Result<(), RtcError> {
        self.outbound.send(text).map_err(|_| RtcError::Closed)
    }

    fn close(&self) {
        let dc = Arc::clone(&self.dc);
        tokio::spawn(async move {
            if let Err(e) = dc.close().await {
                debug!(error = %e, "error closing data channel");
            }
        });
    }
}
