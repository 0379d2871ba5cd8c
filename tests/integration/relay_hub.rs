// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for the relay hub over real WebSocket connections.
//!
//! Each test starts the relay in-process on `127.0.0.1:0` and drives it with
//! `tokio-tungstenite` clients. They validate:
//! - the welcome frame assigns a unique session id
//! - admitted envelopes reach every session, normalized and stamped
//! - blank chat, malformed JSON, client `system` frames, and unknown types
//!   are dropped without ending the session
//! - oversized frames and missed pongs end the session
//! - closing all sessions delivers a close frame to each client

use std::path::Path;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peerlink_proto::codec;
use peerlink_proto::envelope::{Envelope, EnvelopeKind, IceCandidate};
use peerlink_relay::hub::HubHandle;
use peerlink_relay::server::{self, RelayState};
use peerlink_relay::session::SessionConfig;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_relay(config: SessionConfig) -> (String, RelayState) {
    let state = RelayState::new(config);
    let (addr, _handle) = server::start_server("127.0.0.1:0", state.clone(), Path::new("static"))
        .await
        .unwrap();
    (format!("ws://{addr}/ws"), state)
}

/// Connects and consumes the welcome frame, returning the session id.
async fn connect(url: &str) -> (Ws, String) {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let welcome = recv(&mut ws).await;
    assert_eq!(welcome.kind, EnvelopeKind::System);
    assert_eq!(welcome.text.as_deref(), Some("connected"));
    let id = welcome.sender.unwrap();
    (ws, id)
}

async fn send(ws: &mut Ws, envelope: &Envelope) {
    send_raw(ws, &codec::encode(envelope).unwrap()).await;
}

async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::text(text.to_owned())).await.unwrap();
}

/// Receives the next envelope, skipping keepalive frames.
async fn recv(ws: &mut Ws) -> Envelope {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read failed");
        match frame {
            Message::Text(text) => return codec::decode_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Reads until the server ends the connection, returning `true` if a close
/// frame was seen.
async fn wait_for_end(ws: &mut Ws) -> bool {
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, ws.next()).await {
            Err(_) => panic!("connection was not closed"),
            Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(Some(Ok(_))) => {}
            Ok(None | Some(Err(_))) => return false,
        }
    }
}

async fn wait_for_members(hub: &HubHandle, expected: usize) -> Vec<String> {
    for _ in 0..100 {
        let members = hub.members().await.unwrap();
        if members.len() == expected {
            return members;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("hub never reached {expected} members");
}

#[tokio::test]
async fn welcome_fits_a_single_slot_queue() {
    let config = SessionConfig {
        queue_capacity: 1,
        ..SessionConfig::default()
    };
    let (url, state) = start_relay(config).await;
    let (mut ws, id) = connect(&url).await;
    assert_eq!(wait_for_members(&state.hub, 1).await, [id.clone()]);

    // The welcome slot is free again for ordinary traffic.
    send(&mut ws, &Envelope::chat("after welcome")).await;
    let echoed = recv(&mut ws).await;
    assert_eq!(echoed.text.as_deref(), Some("after welcome"));
    assert_eq!(echoed.sender.as_deref(), Some(id.as_str()));
}

#[tokio::test]
async fn sessions_get_unique_ids() {
    let (url, state) = start_relay(SessionConfig::default()).await;
    let (_a, id_a) = connect(&url).await;
    let (_b, id_b) = connect(&url).await;

    assert_ne!(id_a, id_b);
    assert_eq!(id_a.len(), 16);
    let mut expected = vec![id_a, id_b];
    expected.sort();
    assert_eq!(state.hub.members().await.unwrap(), expected);
}

#[tokio::test]
async fn chat_is_normalized_and_broadcast_to_everyone() {
    let (url, _state) = start_relay(SessionConfig::default()).await;
    let (mut alice, alice_id) = connect(&url).await;
    let (mut bob, _) = connect(&url).await;

    send_raw(&mut alice, r#"{"type":"chat","text":"  hi  ","sender":"mallory"}"#).await;

    for ws in [&mut alice, &mut bob] {
        let envelope = recv(ws).await;
        assert_eq!(envelope.kind, EnvelopeKind::Chat);
        assert_eq!(envelope.text.as_deref(), Some("hi"));
        assert_eq!(envelope.sender.as_deref(), Some(alice_id.as_str()));
        assert_eq!(envelope.correlation_id().map(str::len), Some(16));
        assert!(envelope.server_time.is_some());
    }
}

#[tokio::test]
async fn rejected_frames_do_not_end_the_session() {
    let (url, state) = start_relay(SessionConfig::default()).await;
    let (mut alice, _) = connect(&url).await;
    let (mut bob, _) = connect(&url).await;

    send_raw(&mut alice, r#"{"type":"chat","text":"   "}"#).await;
    send_raw(&mut alice, "not json at all").await;
    send_raw(&mut alice, r#"{"type":"system","text":"spoofed"}"#).await;
    send_raw(&mut alice, r#"{"type":"typing"}"#).await;
    send_raw(&mut alice, r#"{"type":""}"#).await;
    send(&mut alice, &Envelope::chat("marker")).await;

    let envelope = recv(&mut bob).await;
    assert_eq!(envelope.text.as_deref(), Some("marker"));
    assert_eq!(state.hub.members().await.unwrap().len(), 2);
}

#[tokio::test]
async fn binary_frames_are_accepted() {
    let (url, _state) = start_relay(SessionConfig::default()).await;
    let (mut alice, _) = connect(&url).await;

    let bytes = codec::encode(&Envelope::chat("binary")).unwrap().into_bytes();
    alice.send(Message::binary(bytes)).await.unwrap();

    let envelope = recv(&mut alice).await;
    assert_eq!(envelope.text.as_deref(), Some("binary"));
}

#[tokio::test]
async fn ping_is_echoed_with_its_id() {
    let (url, _state) = start_relay(SessionConfig::default()).await;
    let (mut alice, alice_id) = connect(&url).await;

    send(&mut alice, &Envelope::ping("probe-1", "2026-01-01T00:00:00.000Z")).await;

    let echo = recv(&mut alice).await;
    assert_eq!(echo.kind, EnvelopeKind::Ping);
    assert_eq!(echo.id.as_deref(), Some("probe-1"));
    assert_eq!(echo.sent_at.as_deref(), Some("2026-01-01T00:00:00.000Z"));
    assert!(echo.is_from(&alice_id));
}

#[tokio::test]
async fn signaling_is_relayed_opaquely() {
    let (url, _state) = start_relay(SessionConfig::default()).await;
    let (mut alice, alice_id) = connect(&url).await;
    let (mut bob, bob_id) = connect(&url).await;

    let mut candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host");
    candidate.sdp_mid = Some("0".into());
    candidate.sdp_mline_index = Some(0);
    send(&mut alice, &Envelope::ice_candidate(&bob_id, candidate.clone())).await;

    let envelope = recv(&mut bob).await;
    assert_eq!(envelope.kind, EnvelopeKind::IceCandidate);
    assert_eq!(envelope.candidate, Some(candidate));
    assert!(envelope.is_addressed_to(&bob_id));
    assert!(envelope.is_from(&alice_id));

    // Targeted envelopes still reach every session.
    let echoed = recv(&mut alice).await;
    assert_eq!(echoed.kind, EnvelopeKind::IceCandidate);
}

#[tokio::test]
async fn signaling_is_dropped_when_disabled() {
    let config = SessionConfig {
        relay_signaling: false,
        ..SessionConfig::default()
    };
    let (url, _state) = start_relay(config).await;
    let (mut alice, _) = connect(&url).await;
    let (mut bob, bob_id) = connect(&url).await;

    send(&mut alice, &Envelope::offer(&bob_id, "v=0")).await;
    send(&mut alice, &Envelope::presence_request()).await;
    send(&mut alice, &Envelope::chat("after")).await;

    let envelope = recv(&mut bob).await;
    assert_eq!(envelope.kind, EnvelopeKind::Chat);
    assert_eq!(envelope.text.as_deref(), Some("after"));
}

#[tokio::test]
async fn oversized_frame_ends_the_session() {
    let (url, state) = start_relay(SessionConfig::default()).await;
    let (mut alice, _) = connect(&url).await;
    let (_bob, bob_id) = connect(&url).await;

    let huge = Envelope::chat("x".repeat(8 * 1024));
    let _ = alice
        .send(Message::text(codec::encode(&huge).unwrap()))
        .await;
    wait_for_end(&mut alice).await;

    assert_eq!(wait_for_members(&state.hub, 1).await, vec![bob_id]);
}

#[tokio::test]
async fn client_disconnect_unregisters() {
    let (url, state) = start_relay(SessionConfig::default()).await;
    let (alice, _) = connect(&url).await;
    let (_bob, bob_id) = connect(&url).await;

    drop(alice);
    assert_eq!(wait_for_members(&state.hub, 1).await, vec![bob_id]);
}

#[tokio::test]
async fn close_all_sends_close_frames() {
    let (url, state) = start_relay(SessionConfig::default()).await;
    let (mut alice, _) = connect(&url).await;
    let (mut bob, _) = connect(&url).await;

    state.close_all_connections().await.unwrap();

    assert!(wait_for_end(&mut alice).await);
    assert!(wait_for_end(&mut bob).await);
    wait_for_members(&state.hub, 0).await;
}

#[tokio::test]
async fn silent_client_is_dropped_after_pong_wait() {
    let config = SessionConfig {
        ping_interval: Duration::from_millis(100),
        pong_wait: Duration::from_millis(300),
        ..SessionConfig::default()
    };
    let (url, state) = start_relay(config).await;

    // A client that keeps reading answers pings; one that never reads does not.
    let (mut live, live_id) = connect(&url).await;
    let reader = tokio::spawn(async move { while let Some(Ok(_)) = live.next().await {} });
    let (_silent, _) = connect(&url).await;

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(wait_for_members(&state.hub, 1).await, vec![live_id]);
    reader.abort();
}
