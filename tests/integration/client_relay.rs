// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! End-to-end tests: clients talking through an in-process relay.
//!
//! The relay runs on `127.0.0.1:0`; direct channels use a shared loopback
//! network so negotiation is real but needs no sockets. They validate:
//! - the welcome assigns each client an id and chat reaches everyone
//! - relay probes are matched to their echo
//! - presence requests populate the registry of the requester
//! - two p2p clients open a channel on discovery and probe/chat over it
//! - a severed channel cancels its in-flight probes
//! - a fresh offer that replaces an open channel cancels its probes
//! - only pings that started at the channel's far end are reflected
//! - signaling is acted on by its target alone, never by a bystander or by
//!   the sender's own echo
//! - a dropped relay connection cancels relay probes, and the reconnect
//!   brings a new id and a fresh registry
//! - shutdown stops the client task

use std::path::Path;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peerlink::client::{Client, ClientCommand, ClientHandle, ClientOptions, ClientSnapshot};
use peerlink::log::{EntryKind, ProbeStatus};
use peerlink::orchestrator::{LinkStatus, LinkUpdate, Orchestrator};
use peerlink::peers::PeerId;
use peerlink::probe::ProbeRoute;
use peerlink::relay::{self, RelayEvent, RelayLink};
use peerlink::rtc::RtcEvent;
use peerlink::rtc::loopback::{LoopbackNetwork, LoopbackRtc};
use peerlink_proto::codec;
use peerlink_proto::envelope::{Envelope, EnvelopeKind};
use peerlink_proto::token::timestamp_now;
use peerlink_relay::server::{self, RelayState};
use peerlink_relay::session::SessionConfig;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

async fn start_relay() -> (String, RelayState) {
    let state = RelayState::new(SessionConfig::default());
    let (addr, _handle) = server::start_server("127.0.0.1:0", state.clone(), Path::new("static"))
        .await
        .unwrap();
    (format!("ws://{addr}/ws"), state)
}

fn options(url: &str, p2p: bool) -> ClientOptions {
    ClientOptions {
        relay_url: url.to_string(),
        p2p,
        connect_timeout: Duration::from_secs(2),
        reconnect_delay: Duration::from_millis(100),
        max_log_entries: 200,
    }
}

/// Polls snapshots until `done` holds, panicking after [`WAIT`].
async fn wait_for(
    handle: &ClientHandle,
    what: &str,
    mut done: impl FnMut(&ClientSnapshot) -> bool,
) -> ClientSnapshot {
    let deadline = Instant::now() + WAIT;
    loop {
        let snapshot = handle.snapshot().await.unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {what}: {snapshot:#?}"
        );
        tokio::time::sleep(POLL).await;
    }
}

/// Starts a client and waits for its welcome, returning the assigned id.
async fn joined(url: &str, p2p: bool, network: &LoopbackNetwork) -> (ClientHandle, PeerId) {
    let (handle, _task) = Client::spawn(options(url, p2p), network.endpoint());
    let snapshot = wait_for(&handle, "welcome", |s| s.self_id.is_some()).await;
    let id = PeerId::from(snapshot.self_id.unwrap().as_str());
    (handle, id)
}

fn has_probe(snapshot: &ClientSnapshot, route: &ProbeRoute, want: fn(&ProbeStatus) -> bool) -> bool {
    snapshot.log.iter().any(|entry| {
        matches!(&entry.kind, EntryKind::Probe { route: r, status, .. } if r == route && want(status))
    })
}

async fn p2p_pair(url: &str, network: &LoopbackNetwork) -> (ClientHandle, PeerId, ClientHandle, PeerId) {
    let (a, a_id) = joined(url, true, network).await;
    let (b, b_id) = joined(url, true, network).await;
    let connected = |peer: &PeerId| {
        let peer = peer.clone();
        move |s: &ClientSnapshot| s.links.contains(&(peer.clone(), LinkStatus::Connected))
    };
    wait_for(&a, "a connected to b", connected(&b_id)).await;
    wait_for(&b, "b connected to a", connected(&a_id)).await;
    (a, a_id, b, b_id)
}

/// A bare orchestrator on its own relay connection, stepped by the test
/// instead of a [`Client`]. It answers signaling but never reflects pings.
struct Remote {
    id: PeerId,
    link: RelayLink,
    relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    orchestrator: Orchestrator<LoopbackRtc>,
    rtc_events: mpsc::UnboundedReceiver<RtcEvent>,
    /// Raw channel payloads, in arrival order.
    received: Vec<String>,
}

impl Remote {
    async fn join(url: &str, network: &LoopbackNetwork) -> Self {
        let socket = relay::connect(url, WAIT).await.unwrap();
        let (tx, mut relay_events) = mpsc::unbounded_channel();
        let (link, io) = RelayLink::new(socket, 1, tx);
        tokio::spawn(io);
        let welcome = tokio::time::timeout(WAIT, async {
            loop {
                match relay_events.recv().await.unwrap() {
                    RelayEvent::Envelope { envelope, .. }
                        if envelope.kind == EnvelopeKind::System =>
                    {
                        return envelope;
                    }
                    _ => {}
                }
            }
        })
        .await
        .unwrap();
        let (tx, rtc_events) = mpsc::unbounded_channel();
        Self {
            id: PeerId::from(welcome.sender.unwrap().as_str()),
            link,
            relay_events,
            orchestrator: Orchestrator::new(network.endpoint(), tx),
            rtc_events,
            received: Vec::new(),
        }
    }

    async fn offer(&mut self, peer: &PeerId) {
        let offer = self.orchestrator.connect(peer).await.unwrap().unwrap();
        self.link.send(&offer).unwrap();
    }

    /// Forgets every link, as if the remote process restarted, and offers
    /// to `peer` again. The old channel is left open.
    async fn restart_and_offer(&mut self, peer: &PeerId, network: &LoopbackNetwork) {
        let (tx, rtc_events) = mpsc::unbounded_channel();
        self.orchestrator = Orchestrator::new(network.endpoint(), tx);
        self.rtc_events = rtc_events;
        self.offer(peer).await;
    }

    fn send_direct(&self, peer: &PeerId, envelope: &Envelope) {
        self.orchestrator
            .send(peer, codec::encode(envelope).unwrap())
            .unwrap();
    }

    /// Services relay and channel events for `period`.
    async fn pump_for(&mut self, period: Duration) {
        let until = Instant::now() + period;
        loop {
            tokio::select! {
                Some(event) = self.relay_events.recv() => self.on_relay(event).await,
                Some(event) = self.rtc_events.recv() => {
                    match self.orchestrator.on_rtc_event(event).await {
                        LinkUpdate::Outbound(envelope) => self.link.send(&envelope).unwrap(),
                        LinkUpdate::Message { text, .. } => self.received.push(text),
                        _ => {}
                    }
                }
                () = tokio::time::sleep_until(until) => return,
            }
        }
    }

    async fn on_relay(&mut self, event: RelayEvent) {
        let RelayEvent::Envelope { envelope, .. } = event else {
            return;
        };
        if !envelope.is_addressed_to(self.id.as_str()) {
            return;
        }
        let from = PeerId::from(envelope.sender.as_deref().unwrap());
        match envelope.kind {
            EnvelopeKind::Offer => {
                let outcome = self
                    .orchestrator
                    .handle_offer(&from, envelope.sdp.unwrap())
                    .await;
                if let Some(answer) = outcome.answer.unwrap() {
                    self.link.send(&answer).unwrap();
                }
            }
            EnvelopeKind::Answer => {
                self.orchestrator
                    .handle_answer(&from, envelope.sdp.unwrap())
                    .await
                    .unwrap();
            }
            EnvelopeKind::IceCandidate => {
                let _ = self
                    .orchestrator
                    .handle_candidate(&from, envelope.candidate.unwrap())
                    .await;
            }
            _ => {}
        }
    }

    /// Pumps until `done` holds for this side, panicking after [`WAIT`].
    async fn pump_until(&mut self, what: &str, done: impl Fn(&Self) -> bool) {
        let deadline = Instant::now() + WAIT;
        while !done(self) {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {what}: {:?}",
                self.received
            );
            self.pump_for(POLL).await;
        }
    }

    /// Pumps until `done` holds for `client`'s snapshot.
    async fn drive_until(
        &mut self,
        client: &ClientHandle,
        what: &str,
        mut done: impl FnMut(&ClientSnapshot) -> bool,
    ) -> ClientSnapshot {
        let deadline = Instant::now() + WAIT;
        loop {
            self.pump_for(POLL).await;
            let snapshot = client.snapshot().await.unwrap();
            if done(&snapshot) {
                return snapshot;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {what}: {snapshot:#?}"
            );
        }
    }
}

/// A p2p-off client with an open channel offered by a [`Remote`].
async fn linked_to_remote(url: &str, network: &LoopbackNetwork) -> (ClientHandle, PeerId, Remote) {
    let (a, a_id) = joined(url, false, network).await;
    let mut remote = Remote::join(url, network).await;
    remote.offer(&a_id).await;

    let remote_id = remote.id.clone();
    remote
        .drive_until(&a, "a connected to remote", |s| {
            s.links.contains(&(remote_id.clone(), LinkStatus::Connected))
        })
        .await;
    remote
        .pump_until("remote channel open", |r| r.orchestrator.is_open(&a_id))
        .await;
    (a, a_id, remote)
}

#[tokio::test]
async fn chat_reaches_every_client() {
    let (url, _state) = start_relay().await;
    let network = LoopbackNetwork::new();
    let (a, a_id) = joined(&url, false, &network).await;
    let (b, b_id) = joined(&url, false, &network).await;
    assert_ne!(a_id, b_id);

    a.chat("hello everyone").unwrap();

    let from_a = |s: &ClientSnapshot| {
        s.log.iter().any(|entry| {
            matches!(&entry.kind, EntryKind::Chat { from, text }
                if from == a_id.as_str() && text == "hello everyone")
        })
    };
    let snapshot = wait_for(&b, "chat at b", from_a).await;
    assert!(snapshot.peers.contains(&a_id));
    // The sender sees its own message echoed back too.
    let snapshot = wait_for(&a, "echo at a", from_a).await;
    assert!(snapshot.peers.is_empty());
}

#[tokio::test]
async fn relay_probe_is_acknowledged() {
    let (url, _state) = start_relay().await;
    let network = LoopbackNetwork::new();
    let (a, _) = joined(&url, false, &network).await;

    a.send(ClientCommand::RelayProbe).unwrap();

    let snapshot = wait_for(&a, "probe ack", |s| {
        has_probe(s, &ProbeRoute::Relay, |st| {
            matches!(st, ProbeStatus::Acknowledged { .. })
        })
    })
    .await;
    assert_eq!(snapshot.pending_relay_probes, 0);
}

#[tokio::test]
async fn presence_request_populates_the_registry() {
    let (url, _state) = start_relay().await;
    let network = LoopbackNetwork::new();
    let (a, a_id) = joined(&url, false, &network).await;
    let (b, b_id) = joined(&url, false, &network).await;

    b.send(ClientCommand::RequestPresence).unwrap();

    wait_for(&b, "b learns a", |s| s.peers.contains(&a_id)).await;
    wait_for(&a, "a learns b", |s| s.peers.contains(&b_id)).await;
    // Nobody negotiates with p2p off.
    assert!(a.snapshot().await.unwrap().links.is_empty());
}

#[tokio::test]
async fn p2p_clients_connect_on_discovery() {
    let (url, _state) = start_relay().await;
    let network = LoopbackNetwork::new();
    let (a, a_id, b, b_id) = p2p_pair(&url, &network).await;

    assert_eq!(network.open_channels(), 2);
    assert!(a.snapshot().await.unwrap().peers.contains(&b_id));
    assert!(b.snapshot().await.unwrap().peers.contains(&a_id));
}

#[tokio::test]
async fn direct_probe_and_chat_use_the_channel() {
    let (url, _state) = start_relay().await;
    let network = LoopbackNetwork::new();
    let (a, a_id, b, b_id) = p2p_pair(&url, &network).await;

    a.send(ClientCommand::PeerProbe(b_id.clone())).unwrap();
    let route = ProbeRoute::Direct(b_id.clone());
    let snapshot = wait_for(&a, "direct probe ack", |s| {
        has_probe(s, &route, |st| matches!(st, ProbeStatus::Acknowledged { .. }))
    })
    .await;
    assert_eq!(snapshot.pending_direct_probes, 0);

    a.send(ClientCommand::DirectChat {
        peer: b_id.clone(),
        text: "just us".into(),
    })
    .unwrap();
    wait_for(&b, "direct chat at b", |s| {
        s.log.iter().any(|entry| {
            matches!(&entry.kind, EntryKind::Direct { peer, text, outbound: false }
                if *peer == a_id && text == "just us")
        })
    })
    .await;
    let snapshot = a.snapshot().await.unwrap();
    assert!(snapshot.log.iter().any(|entry| matches!(
        &entry.kind,
        EntryKind::Direct { outbound: true, .. }
    )));
    // Direct chat never touches the relay.
    assert!(!snapshot.log.iter().any(|entry| matches!(
        &entry.kind,
        EntryKind::Chat { text, .. } if text == "just us"
    )));
}

#[tokio::test]
async fn severed_channel_cancels_direct_probe() {
    let (url, _state) = start_relay().await;
    let network = LoopbackNetwork::new();
    let (a, _a_id, _b, b_id) = p2p_pair(&url, &network).await;

    network.pause_delivery();
    a.send(ClientCommand::PeerProbe(b_id.clone())).unwrap();
    wait_for(&a, "probe in flight", |s| s.pending_direct_probes == 1).await;

    network.sever_all();

    let route = ProbeRoute::Direct(b_id.clone());
    let snapshot = wait_for(&a, "probe canceled", |s| {
        s.pending_direct_probes == 0 && has_probe(s, &route, |st| *st == ProbeStatus::Canceled)
    })
    .await;
    assert!(!snapshot.links.iter().any(|(peer, _)| *peer == b_id));
}

#[tokio::test]
async fn fresh_offer_on_an_open_channel_cancels_its_pending_probe() {
    let (url, _state) = start_relay().await;
    let network = LoopbackNetwork::new();
    let (a, a_id, mut remote) = linked_to_remote(&url, &network).await;
    let remote_id = remote.id.clone();

    a.send(ClientCommand::PeerProbe(remote_id.clone())).unwrap();
    remote
        .drive_until(&a, "probe in flight", |s| s.pending_direct_probes == 1)
        .await;

    remote.restart_and_offer(&a_id, &network).await;

    let route = ProbeRoute::Direct(remote_id.clone());
    let snapshot = remote
        .drive_until(&a, "probe canceled by the new link", |s| {
            s.pending_direct_probes == 0
                && s.links.contains(&(remote_id.clone(), LinkStatus::Connected))
        })
        .await;
    assert!(has_probe(&snapshot, &route, |st| *st == ProbeStatus::Canceled));
    let closed = format!("direct channel to {remote_id} closed");
    assert!(snapshot.log.iter().any(|entry| matches!(
        &entry.kind,
        EntryKind::System(text) if *text == closed
    )));
}

#[tokio::test]
async fn only_pings_from_the_far_end_are_reflected() {
    let (url, _state) = start_relay().await;
    let network = LoopbackNetwork::new();
    let (a, a_id, mut remote) = linked_to_remote(&url, &network).await;

    // A sender that is neither end of the channel, such as a stale id.
    let stray = Envelope::ping("stray", timestamp_now()).with_sender("someone-else");
    let genuine = Envelope::ping("genuine", timestamp_now()).with_sender(remote.id.as_str());
    remote.send_direct(&a_id, &stray);
    remote.send_direct(&a_id, &genuine);

    remote
        .pump_until("genuine ping reflected", |r| !r.received.is_empty())
        .await;
    // Give a reflected stray ping time to show up behind it.
    remote.pump_for(POLL * 5).await;

    let ids: Vec<_> = remote
        .received
        .iter()
        .map(|text| codec::decode_str(text).unwrap().id)
        .collect();
    assert_eq!(ids, [Some("genuine".to_string())]);
    assert_eq!(a.snapshot().await.unwrap().pending_direct_probes, 0);
}

#[tokio::test]
async fn signaling_is_acted_on_only_by_its_target() {
    let (url, _state) = start_relay().await;
    let network = LoopbackNetwork::new();
    let (a, a_id) = joined(&url, false, &network).await;
    let (b, b_id) = joined(&url, false, &network).await;
    let (c, _c_id) = joined(&url, false, &network).await;

    a.send(ClientCommand::Connect(b_id.clone())).unwrap();
    wait_for(&a, "a connected to b", |s| {
        s.links.contains(&(b_id.clone(), LinkStatus::Connected))
    })
    .await;
    wait_for(&b, "b connected to a", |s| {
        s.links.contains(&(a_id.clone(), LinkStatus::Connected))
    })
    .await;

    let failed = |s: &ClientSnapshot| {
        s.log.iter().any(|entry| {
            matches!(&entry.kind, EntryKind::Info(text) if text.starts_with("negotiation with"))
        })
    };

    // The bystander saw the offer, the answer, and every candidate.
    let snapshot = wait_for(&c, "c discovers both ends", |s| {
        s.peers.contains(&a_id) && s.peers.contains(&b_id)
    })
    .await;
    assert!(snapshot.links.is_empty());
    assert!(!failed(&snapshot));

    // The offer came back to its sender too and was not answered.
    let snapshot = a.snapshot().await.unwrap();
    assert_eq!(snapshot.links, [(b_id.clone(), LinkStatus::Connected)]);
    assert!(!snapshot.peers.contains(&a_id));
    assert!(!failed(&snapshot));
    assert_eq!(network.open_channels(), 2);
}

#[tokio::test]
async fn probe_without_channel_starts_negotiation() {
    let (url, _state) = start_relay().await;
    let network = LoopbackNetwork::new();
    let (a, _a_id) = joined(&url, false, &network).await;
    let (b, b_id) = joined(&url, false, &network).await;
    b.chat("hi").unwrap();
    wait_for(&a, "a learns b", |s| s.peers.contains(&b_id)).await;

    a.send(ClientCommand::PeerProbe(b_id.clone())).unwrap();

    // The probe itself is not sent, but the link comes up for the next one.
    let snapshot = wait_for(&a, "link to b", |s| {
        s.links.contains(&(b_id.clone(), LinkStatus::Connected))
    })
    .await;
    assert_eq!(snapshot.pending_direct_probes, 0);
    assert!(!has_probe(&snapshot, &ProbeRoute::Direct(b_id.clone()), |_| true));
}

#[tokio::test]
async fn relay_drop_cancels_pending_relay_probe() {
    // A relay stand-in that welcomes, swallows one frame, then hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let welcome = Envelope::system("connected").with_sender("solo");
        ws.send(Message::text(codec::encode(&welcome).unwrap()))
            .await
            .unwrap();
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let envelope = codec::decode_str(text.as_str()).unwrap();
                    if envelope.kind == EnvelopeKind::Ping {
                        let _ = seen_tx.send(());
                        break;
                    }
                }
                Some(Ok(_)) => {}
                _ => return,
            }
        }
        ws.close(None).await.unwrap();
        // Keep the listener from accepting the reconnect.
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let network = LoopbackNetwork::new();
    let (a, _task) = Client::spawn(options(&url, false), network.endpoint());
    wait_for(&a, "welcome", |s| s.self_id.as_deref() == Some("solo")).await;

    a.send(ClientCommand::RelayProbe).unwrap();
    tokio::time::timeout(WAIT, seen_rx).await.unwrap().unwrap();

    let snapshot = wait_for(&a, "probe canceled", |s| {
        !s.relay_connected && s.pending_relay_probes == 0
    })
    .await;
    assert!(has_probe(&snapshot, &ProbeRoute::Relay, |st| {
        *st == ProbeStatus::Canceled
    }));
}

#[tokio::test]
async fn reconnect_brings_a_new_id_and_fresh_registry() {
    let (url, state) = start_relay().await;
    let network = LoopbackNetwork::new();
    let (a, a_id) = joined(&url, false, &network).await;
    let (b, b_id) = joined(&url, false, &network).await;
    b.chat("before").unwrap();
    wait_for(&a, "a learns b", |s| s.peers.contains(&b_id)).await;

    state.close_all_connections().await.unwrap();

    let snapshot = wait_for(&a, "new id", |s| {
        s.relay_connected && s.self_id.as_deref().is_some_and(|id| id != a_id.as_str())
    })
    .await;
    assert!(!snapshot.peers.contains(&b_id));
    assert!(snapshot.log.iter().any(|entry| matches!(
        &entry.kind,
        EntryKind::System(text) if text == "disconnected from relay"
    )));

    // Chat works again over the new connection.
    let b_new = wait_for(&b, "b new id", |s| {
        s.relay_connected && s.self_id.as_deref().is_some_and(|id| id != b_id.as_str())
    })
    .await
    .self_id
    .unwrap();
    b.chat("after").unwrap();
    wait_for(&a, "a learns new b", |s| s.peers.contains(&PeerId::from(b_new.as_str()))).await;
}

#[tokio::test]
async fn shutdown_stops_the_client() {
    let (url, _state) = start_relay().await;
    let network = LoopbackNetwork::new();
    let (handle, task) = Client::spawn(options(&url, false), network.endpoint());
    wait_for(&handle, "welcome", |s| s.self_id.is_some()).await;

    handle.shutdown().unwrap();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert!(handle.snapshot().await.is_err());
    assert!(handle.chat("too late").is_err());
}
