//! The client task.
//!
//! A single task owns all client state and reacts to four sources:
//! user commands, relay events, backend events, and the reconnect timer.
//! Nothing else touches the state, so handlers run one at a time and never
//! race each other. [`ClientHandle`] is the only way in from outside.
//!
//! Inbound relay envelopes are processed in this order:
//!
//! 1. `system` frames carry the local id assigned by the relay.
//! 2. Our own envelopes are recognized by `sender` (relay probe echoes).
//! 3. Signaling addressed to us is handed to the orchestrator *before* the
//!    sender is recorded as a peer, so an incoming offer is answered
//!    instead of racing a fresh offer of our own.
//! 4. Every other envelope records its sender first and is then handled.

use std::pin::Pin;
use std::time::Duration;

use peerlink_proto::codec;
use peerlink_proto::envelope::{Envelope, EnvelopeKind};
use peerlink_proto::token::{new_token, timestamp_now};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use crate::log::{EntryKind, LogEntry, LogEvent, MessageLog, ProbeStatus};
use crate::orchestrator::{LinkStatus, LinkUpdate, Orchestrator};
use crate::peers::{PeerId, PeerRegistry};
use crate::probe::{ProbeRoute, ProbeTracker};
use crate::relay::{self, RelayEvent, RelayLink};
use crate::rtc::{RtcApi, RtcEvent};

/// Text of the relay's welcome frame.
const WELCOME_TEXT: &str = "connected";

/// Runtime options for a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Relay WebSocket URL.
    pub relay_url: String,
    /// Negotiate direct channels with discovered peers.
    pub p2p: bool,
    /// Timeout for one relay connection attempt.
    pub connect_timeout: Duration,
    /// Delay before reconnecting after the relay connection drops.
    pub reconnect_delay: Duration,
    /// Number of entries kept in the message log.
    pub max_log_entries: usize,
}

/// Requests accepted by the client task.
#[derive(Debug)]
pub enum ClientCommand {
    /// Broadcast a chat line through the relay.
    Chat(String),
    /// Measure the round trip through the relay.
    RelayProbe,
    /// Measure the round trip over the direct channel to a peer.
    PeerProbe(PeerId),
    /// Send a chat line over the direct channel to a peer.
    DirectChat {
        /// Recipient.
        peer: PeerId,
        /// Message text.
        text: String,
    },
    /// Ask every other client to announce itself.
    RequestPresence,
    /// Start negotiating a direct channel to a peer.
    Connect(PeerId),
    /// Tear down the direct channel to a peer.
    Disconnect(PeerId),
    /// Turn automatic peer-to-peer negotiation on or off.
    SetP2p(bool),
    /// Report the current state.
    Snapshot(oneshot::Sender<ClientSnapshot>),
    /// Close everything and stop the task.
    Shutdown,
}

/// Point-in-time view of the client.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    /// Id assigned by the relay, once welcomed.
    pub self_id: Option<String>,
    /// Whether a relay connection is up.
    pub relay_connected: bool,
    /// Whether automatic negotiation is on.
    pub p2p: bool,
    /// Peers seen on the relay.
    pub peers: Vec<PeerId>,
    /// Direct links and their status.
    pub links: Vec<(PeerId, LinkStatus)>,
    /// Relay probes in flight.
    pub pending_relay_probes: usize,
    /// Direct probes in flight.
    pub pending_direct_probes: usize,
    /// Retained log entries, oldest first.
    pub log: Vec<LogEntry>,
}

/// The client task has exited.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("client task has stopped")]
pub struct ClientStopped;

/// Cloneable handle for driving a running [`Client`].
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    log_events: broadcast::Sender<LogEvent>,
}

impl ClientHandle {
    /// Queues a command.
    ///
    /// # Errors
    ///
    /// Returns [`ClientStopped`] if the client task has exited.
    pub fn send(&self, command: ClientCommand) -> Result<(), ClientStopped> {
        self.commands.send(command).map_err(|_| ClientStopped)
    }

    /// Subscribes to log appends and updates from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.log_events.subscribe()
    }

    /// Fetches a snapshot of the client state.
    ///
    /// # Errors
    ///
    /// Returns [`ClientStopped`] if the client task has exited.
    pub async fn snapshot(&self) -> Result<ClientSnapshot, ClientStopped> {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::Snapshot(reply))?;
        rx.await.map_err(|_| ClientStopped)
    }

    /// Broadcasts a chat line.
    ///
    /// # Errors
    ///
    /// Returns [`ClientStopped`] if the client task has exited.
    pub fn chat(&self, text: impl Into<String>) -> Result<(), ClientStopped> {
        self.send(ClientCommand::Chat(text.into()))
    }

    /// Asks the client to shut down.
    ///
    /// # Errors
    ///
    /// Returns [`ClientStopped`] if the client task has already exited.
    pub fn shutdown(&self) -> Result<(), ClientStopped> {
        self.send(ClientCommand::Shutdown)
    }
}

/// The client state machine. See the module docs.
pub struct Client<R: RtcApi> {
    options: ClientOptions,
    p2p: bool,
    self_id: Option<String>,
    peers: PeerRegistry,
    orchestrator: Orchestrator<R>,
    probes: ProbeTracker,
    log: MessageLog,

    relay: Option<RelayLink>,
    generation: u64,
    connecting: bool,
    reconnect_at: Option<Pin<Box<Sleep>>>,
    shutting_down: bool,

    commands: mpsc::UnboundedReceiver<ClientCommand>,
    relay_tx: mpsc::UnboundedSender<RelayEvent>,
    relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    rtc_rx: mpsc::UnboundedReceiver<RtcEvent>,
}

impl<R: RtcApi> std::fmt::Debug for Client<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("self_id", &self.self_id)
            .field("p2p", &self.p2p)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl<R: RtcApi> Client<R> {
    /// Builds a client without starting it.
    ///
    /// Subscribe through the returned handle before calling [`run`] to see
    /// every log event from the first connection attempt on.
    ///
    /// [`run`]: Self::run
    pub fn new(options: ClientOptions, rtc: R) -> (Self, ClientHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (rtc_tx, rtc_rx) = mpsc::unbounded_channel();
        let log = MessageLog::new(options.max_log_entries);
        let handle = ClientHandle {
            commands: command_tx,
            log_events: log.event_sender(),
        };
        let client = Self {
            p2p: options.p2p,
            options,
            self_id: None,
            peers: PeerRegistry::new(),
            orchestrator: Orchestrator::new(rtc, rtc_tx),
            probes: ProbeTracker::new(),
            log,
            relay: None,
            generation: 0,
            connecting: false,
            reconnect_at: None,
            shutting_down: false,
            commands,
            relay_tx,
            relay_rx,
            rtc_rx,
        };
        (client, handle)
    }

    /// Builds a client and spawns it on the current runtime.
    pub fn spawn(options: ClientOptions, rtc: R) -> (ClientHandle, JoinHandle<()>) {
        let (client, handle) = Self::new(options, rtc);
        (handle, tokio::spawn(client.run()))
    }

    /// Runs until [`ClientCommand::Shutdown`] arrives or every handle is
    /// dropped.
    pub async fn run(mut self) {
        self.start_connect();
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if matches!(command, ClientCommand::Shutdown) {
                        break;
                    }
                    self.handle_command(command).await;
                }
                Some(event) = self.relay_rx.recv() => self.handle_relay_event(event).await,
                Some(event) = self.rtc_rx.recv() => self.handle_rtc_event(event).await,
                () = reconnect_due(&mut self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_connect();
                }
            }
        }
        self.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Relay connection lifecycle
    // -----------------------------------------------------------------------

    fn start_connect(&mut self) {
        if self.shutting_down || self.connecting || self.relay.is_some() {
            return;
        }
        self.connecting = true;
        self.generation += 1;
        let generation = self.generation;
        let url = self.options.relay_url.clone();
        let timeout = self.options.connect_timeout;
        let events = self.relay_tx.clone();
        debug!(generation, %url, "connecting to relay");

        tokio::spawn(async move {
            match relay::connect(&url, timeout).await {
                Ok(socket) => {
                    let (link, io) = RelayLink::new(socket, generation, events.clone());
                    // The link must reach the client before any envelope.
                    if events.send(RelayEvent::Connected { generation, link }).is_ok() {
                        io.await;
                    }
                }
                Err(error) => {
                    let _ = events.send(RelayEvent::ConnectFailed { generation, error });
                }
            }
        });
    }

    fn schedule_reconnect(&mut self) {
        if self.shutting_down || self.connecting || self.relay.is_some() {
            return;
        }
        if self.reconnect_at.is_none() {
            let delay = self.options.reconnect_delay;
            info!(?delay, "reconnecting to relay after delay");
            self.reconnect_at = Some(Box::pin(tokio::time::sleep(delay)));
        }
    }

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected { generation, link } => {
                if generation != self.generation || self.shutting_down {
                    // Dropping the link closes the stale socket.
                    return;
                }
                self.connecting = false;
                self.relay = Some(link);
                self.log.system("connected to relay");
            }
            RelayEvent::ConnectFailed { generation, error } => {
                if generation != self.generation {
                    return;
                }
                self.connecting = false;
                warn!(%error, "relay connection attempt failed");
                self.log.info(format!("relay unavailable: {error}"));
                self.schedule_reconnect();
            }
            RelayEvent::Envelope {
                generation,
                envelope,
            } => {
                if generation == self.generation && self.relay.is_some() {
                    self.handle_envelope(envelope).await;
                }
            }
            RelayEvent::Closed { generation } => {
                if generation != self.generation || self.relay.is_none() {
                    return;
                }
                self.relay = None;
                self.log.system("disconnected from relay");
                for entry in self.probes.cancel_relay() {
                    self.log.resolve_probe(entry, ProbeStatus::Canceled);
                }
                self.schedule_reconnect();
            }
        }
    }

    fn send_relay(&self, envelope: &Envelope) -> bool {
        let Some(link) = &self.relay else {
            debug!(kind = %envelope.kind, "relay offline, dropping envelope");
            return false;
        };
        match link.send(envelope) {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "relay send failed");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound relay envelopes
    // -----------------------------------------------------------------------

    async fn handle_envelope(&mut self, envelope: Envelope) {
        if envelope.kind == EnvelopeKind::System {
            self.handle_system(envelope);
            return;
        }
        let Some(self_id) = self.self_id.clone() else {
            debug!(kind = %envelope.kind, "envelope before welcome, dropping");
            return;
        };
        let from_self = envelope.is_from(&self_id);

        if envelope.kind.is_signaling() {
            if !from_self && envelope.is_addressed_to(&self_id) {
                self.handle_signaling(envelope.clone()).await;
            }
            self.observe_sender(&envelope).await;
            return;
        }

        self.observe_sender(&envelope).await;
        match envelope.kind {
            EnvelopeKind::Chat => {
                let from = envelope.sender.unwrap_or_default();
                let text = envelope.text.unwrap_or_default();
                self.log.append(EntryKind::Chat { from, text });
            }
            EnvelopeKind::Ping if from_self => {
                let Some(id) = envelope.correlation_id() else {
                    return;
                };
                if let Some(acked) = self.probes.acknowledge_relay(id) {
                    debug!(id, latency = ?acked.latency, "relay probe acknowledged");
                    self.log.resolve_probe(
                        acked.entry,
                        ProbeStatus::Acknowledged {
                            latency: acked.latency,
                        },
                    );
                }
            }
            EnvelopeKind::PresenceRequest if !from_self => {
                if let Some(sender) = envelope.sender.as_deref() {
                    self.send_relay(&Envelope::presence(sender));
                }
            }
            EnvelopeKind::Presence if !from_self && envelope.is_addressed_to(&self_id) => {
                let Some(peer) = envelope.sender.as_deref().map(PeerId::from) else {
                    return;
                };
                if self.p2p && !self.orchestrator.has_link(&peer) {
                    self.connect_peer(&peer).await;
                }
            }
            _ => {}
        }
    }

    fn handle_system(&mut self, envelope: Envelope) {
        let text = envelope.text.unwrap_or_default();
        let Some(id) = envelope.sender.filter(|_| text == WELCOME_TEXT) else {
            self.log.system(text);
            return;
        };
        if self.self_id.as_deref() != Some(id.as_str()) {
            if self.self_id.is_some() {
                self.peers.reset();
            }
            info!(self_id = %id, "relay assigned id");
            self.log.system(format!("you are {id}"));
            self.self_id = Some(id);
        }
        if self.p2p {
            self.send_relay(&Envelope::presence_request());
        }
    }

    async fn observe_sender(&mut self, envelope: &Envelope) {
        let Some(sender) = envelope.sender.as_deref() else {
            return;
        };
        if !self.peers.observe(sender, self.self_id.as_deref()) {
            return;
        }
        let peer = PeerId::from(sender);
        info!(%peer, "discovered peer");
        self.log.info(format!("discovered peer {peer}"));
        if self.p2p {
            self.connect_peer(&peer).await;
        }
    }

    async fn handle_signaling(&mut self, envelope: Envelope) {
        let Some(peer) = envelope.sender.as_deref().map(PeerId::from) else {
            return;
        };
        let result = match envelope.kind {
            EnvelopeKind::Offer => match envelope.sdp {
                Some(sdp) => {
                    let outcome = self.orchestrator.handle_offer(&peer, sdp).await;
                    if outcome.replaced {
                        self.link_closed(&peer);
                    }
                    outcome.answer.map(|answer| {
                        if let Some(answer) = answer {
                            self.send_relay(&answer);
                        }
                    })
                }
                None => {
                    debug!(%peer, "offer without sdp");
                    Ok(())
                }
            },
            EnvelopeKind::Answer => match envelope.sdp {
                Some(sdp) => self.orchestrator.handle_answer(&peer, sdp).await,
                None => {
                    debug!(%peer, "answer without sdp");
                    Ok(())
                }
            },
            EnvelopeKind::IceCandidate => match envelope.candidate {
                Some(candidate) => self.orchestrator.handle_candidate(&peer, candidate).await,
                None => {
                    debug!(%peer, "ice-candidate without candidate");
                    Ok(())
                }
            },
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(%peer, kind = %envelope.kind, error = %e, "signaling failed");
            if envelope.kind != EnvelopeKind::IceCandidate {
                self.log.info(format!("negotiation with {peer} failed: {e}"));
            }
        }
    }

    async fn connect_peer(&mut self, peer: &PeerId) {
        if self.self_id.as_deref() == Some(peer.as_str()) {
            return;
        }
        match self.orchestrator.connect(peer).await {
            Ok(Some(offer)) => {
                self.log.info(format!("connecting to {peer}"));
                self.send_relay(&offer);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%peer, error = %e, "could not start negotiation");
                self.log.info(format!("could not connect to {peer}: {e}"));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Direct links
    // -----------------------------------------------------------------------

    async fn handle_rtc_event(&mut self, event: RtcEvent) {
        match self.orchestrator.on_rtc_event(event).await {
            LinkUpdate::None => {}
            LinkUpdate::Outbound(envelope) => {
                self.send_relay(&envelope);
            }
            LinkUpdate::Opened(peer) => {
                self.log.system(format!("direct channel to {peer} open"));
            }
            LinkUpdate::Closed(peer) => self.link_closed(&peer),
            LinkUpdate::Message { peer, text } => self.handle_direct_message(&peer, text),
        }
    }

    fn link_closed(&mut self, peer: &PeerId) {
        for entry in self.probes.cancel_direct(peer) {
            self.log.resolve_probe(entry, ProbeStatus::Canceled);
        }
        self.log.system(format!("direct channel to {peer} closed"));
    }

    fn handle_direct_message(&mut self, peer: &PeerId, text: String) {
        let envelope = match codec::decode_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(%peer, error = %e, "malformed channel message, skipping");
                return;
            }
        };
        match envelope.kind {
            EnvelopeKind::Ping => {
                let Some(id) = envelope.correlation_id() else {
                    return;
                };
                if let Some(acked) = self.probes.acknowledge_direct(peer, id) {
                    self.log.resolve_probe(
                        acked.entry,
                        ProbeStatus::Acknowledged {
                            latency: acked.latency,
                        },
                    );
                    return;
                }
                // Only pings that started at the far end are reflected. Our
                // own id may have changed since we sent one.
                if !envelope.is_from(peer.as_str()) {
                    debug!(%peer, sender = ?envelope.sender, "dropping unmatched ping");
                    return;
                }
                // Reflect unchanged so the originator can match its id.
                if let Err(e) = self.orchestrator.send(peer, text) {
                    debug!(%peer, error = %e, "could not reflect probe");
                }
            }
            EnvelopeKind::Chat => {
                self.log.append(EntryKind::Direct {
                    peer: peer.clone(),
                    text: envelope.text.unwrap_or_default(),
                    outbound: false,
                });
            }
            other => debug!(%peer, kind = %other, "ignoring channel message"),
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Chat(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return;
                }
                if !self.send_relay(&Envelope::chat(text)) {
                    self.log.info("not connected to relay; message not sent");
                }
            }
            ClientCommand::RelayProbe => self.relay_probe(),
            ClientCommand::PeerProbe(peer) => self.peer_probe(peer).await,
            ClientCommand::DirectChat { peer, text } => self.direct_chat(peer, text).await,
            ClientCommand::RequestPresence => {
                if !self.send_relay(&Envelope::presence_request()) {
                    self.log.info("not connected to relay");
                }
            }
            ClientCommand::Connect(peer) => self.connect_peer(&peer).await,
            ClientCommand::Disconnect(peer) => {
                if self.orchestrator.disconnect(&peer).await {
                    self.link_closed(&peer);
                } else {
                    self.log.info(format!("no link to {peer}"));
                }
            }
            ClientCommand::SetP2p(enabled) => {
                self.p2p = enabled;
                self.log
                    .info(format!("p2p {}", if enabled { "on" } else { "off" }));
                if enabled {
                    self.send_relay(&Envelope::presence_request());
                }
            }
            ClientCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            ClientCommand::Shutdown => {}
        }
    }

    fn relay_probe(&mut self) {
        if self.relay.is_none() {
            self.log.info("not connected to relay");
            return;
        }
        let id = new_token();
        let entry = self.log.append(EntryKind::Probe {
            route: ProbeRoute::Relay,
            id: id.clone(),
            status: ProbeStatus::Pending,
        });
        if !self.probes.start(ProbeRoute::Relay, id.clone(), entry) {
            debug!(%id, "probe id already pending");
            self.log.resolve_probe(entry, ProbeStatus::Canceled);
            return;
        }
        if !self.send_relay(&Envelope::ping(id.as_str(), timestamp_now())) {
            self.probes.cancel(&id);
            self.log.resolve_probe(entry, ProbeStatus::Canceled);
        }
    }

    async fn peer_probe(&mut self, peer: PeerId) {
        let Some(self_id) = self.self_id.clone() else {
            self.log.info("no id assigned yet");
            return;
        };
        if !self.orchestrator.is_open(&peer) {
            self.log.info(format!("no open channel to {peer}"));
            self.connect_peer(&peer).await;
            return;
        }
        let id = new_token();
        let ping = Envelope::ping(id.as_str(), timestamp_now()).with_sender(self_id);
        let text = match codec::encode(&ping) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "could not encode probe");
                return;
            }
        };
        let route = ProbeRoute::Direct(peer.clone());
        let entry = self.log.append(EntryKind::Probe {
            route: route.clone(),
            id: id.clone(),
            status: ProbeStatus::Pending,
        });
        if !self.probes.start(route, id.clone(), entry) {
            debug!(%peer, %id, "probe id already pending");
            self.log.resolve_probe(entry, ProbeStatus::Canceled);
            return;
        }
        if let Err(e) = self.orchestrator.send(&peer, text) {
            debug!(%peer, error = %e, "probe send failed");
            self.probes.cancel(&id);
            self.log.resolve_probe(entry, ProbeStatus::Canceled);
        }
    }

    async fn direct_chat(&mut self, peer: PeerId, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        if !self.orchestrator.is_open(&peer) {
            self.log.info(format!("no open channel to {peer}"));
            self.connect_peer(&peer).await;
            return;
        }
        let mut envelope = Envelope::chat(text.as_str());
        if let Some(id) = &self.self_id {
            envelope = envelope.with_sender(id.as_str());
        }
        let sent = codec::encode(&envelope)
            .map_err(|e| e.to_string())
            .and_then(|wire| self.orchestrator.send(&peer, wire).map_err(|e| e.to_string()));
        match sent {
            Ok(()) => {
                self.log.append(EntryKind::Direct {
                    peer,
                    text,
                    outbound: true,
                });
            }
            Err(e) => {
                self.log.info(format!("could not send to {peer}: {e}"));
            }
        }
    }

    fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            self_id: self.self_id.clone(),
            relay_connected: self.relay.is_some(),
            p2p: self.p2p,
            peers: self.peers.iter().cloned().collect(),
            links: self.orchestrator.statuses(),
            pending_relay_probes: self.probes.pending_relay(),
            pending_direct_probes: self.probes.pending_direct(),
            log: self.log.entries().cloned().collect(),
        }
    }

    async fn shutdown(&mut self) {
        self.shutting_down = true;
        self.reconnect_at = None;
        for entry in self.probes.cancel_all() {
            self.log.resolve_probe(entry, ProbeStatus::Canceled);
        }
        self.orchestrator.close_all().await;
        // Dropping the link closes the socket.
        self.relay = None;
        self.log.system("shut down");
        info!("client stopped");
    }
}

/// Resolves when the reconnect timer fires; never resolves without one.
async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
