//! One relay session per WebSocket connection.
//!
//! A session is assigned an ephemeral id, greeted with a `system` frame, and
//! registered with the hub. It then runs two tasks: a reader that admits
//! inbound envelopes and forwards them to the hub, and a writer that drains
//! the session's bounded queue and keeps the connection alive with pings.
//! When either task ends, the other is aborted and the session is
//! unregistered.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use peerlink_proto::codec;
use peerlink_proto::envelope::{Envelope, EnvelopeKind};
use peerlink_proto::token;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::hub::HubHandle;

/// Per-session limits and admission policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest inbound frame accepted, in bytes. Larger frames end the session.
    pub max_frame_size: usize,
    /// Capacity of the outbound queue.
    pub queue_capacity: usize,
    /// Interval between WebSocket pings.
    pub ping_interval: Duration,
    /// How long the reader waits for a pong before giving up.
    pub pong_wait: Duration,
    /// Deadline for a single write.
    pub write_wait: Duration,
    /// Forward presence and signaling envelopes between clients.
    pub relay_signaling: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            max_frame_size: 4096,
            queue_capacity: 16,
            ping_interval: pong_wait * 9 / 10,
            pong_wait,
            write_wait: Duration::from_secs(10),
            relay_signaling: true,
        }
    }
}

/// Why an inbound envelope was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Chat whose text is empty after trimming.
    EmptyChat,
    /// A type only the server may emit.
    ServerOnly,
    /// Presence or signaling while relaying of those is disabled.
    SignalingDisabled,
    /// A type this relay does not know.
    UnknownType,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EmptyChat => "empty chat",
            Self::ServerOnly => "server-only type",
            Self::SignalingDisabled => "signaling relay disabled",
            Self::UnknownType => "unknown type",
        })
    }
}

/// Result of admitting one inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Broadcast this (normalized) envelope.
    Forward(Envelope),
    /// Discard the envelope.
    Drop(DropReason),
}

/// Applies the admission policy to an envelope received from `session_id`.
///
/// Accepted envelopes have their `id` defaulted to a fresh token when
/// missing or empty and their `sender` overwritten with `session_id`.
/// `serverTime` is left for the hub to stamp at broadcast time.
#[must_use]
pub fn admit(mut envelope: Envelope, session_id: &str, relay_signaling: bool) -> Admission {
    match envelope.kind {
        EnvelopeKind::Chat => {
            let trimmed = envelope.text.as_deref().unwrap_or_default().trim().to_owned();
            if trimmed.is_empty() {
                return Admission::Drop(DropReason::EmptyChat);
            }
            envelope.text = Some(trimmed);
        }
        EnvelopeKind::Ping => {}
        kind if kind.is_peer_protocol() => {
            if !relay_signaling {
                return Admission::Drop(DropReason::SignalingDisabled);
            }
        }
        EnvelopeKind::System => return Admission::Drop(DropReason::ServerOnly),
        _ => return Admission::Drop(DropReason::UnknownType),
    }

    if envelope.correlation_id().is_none() {
        envelope.id = Some(token::new_token());
    }
    envelope.sender = Some(session_id.to_owned());
    Admission::Forward(envelope)
}

/// The greeting a session receives right after registration.
#[must_use]
pub fn welcome(session_id: &str) -> Envelope {
    let mut envelope = Envelope::system("connected")
        .with_id(token::new_token())
        .with_sender(session_id);
    envelope.server_time = Some(token::timestamp_now());
    envelope
}

/// Runs a session on an upgraded WebSocket until it ends.
pub async fn handle_socket(socket: WebSocket, hub: HubHandle, config: Arc<SessionConfig>) {
    let session_id = token::new_token();
    let (queue, outbound) = mpsc::channel::<Utf8Bytes>(config.queue_capacity);

    match codec::encode(&welcome(&session_id)) {
        Ok(text) => {
            if let Err(e) = queue.try_send(text.into()) {
                tracing::warn!(session_id = %session_id, error = %e, "failed to enqueue welcome");
            }
        }
        Err(e) => tracing::error!(session_id = %session_id, error = %e, "failed to encode welcome"),
    }

    if hub.register(session_id.clone(), queue).await.is_err() {
        tracing::error!(session_id = %session_id, "hub unavailable, refusing session");
        return;
    }
    tracing::info!(session_id = %session_id, "session connected");

    let (sink, stream) = socket.split();

    let mut write_task = tokio::spawn(write_loop(
        sink,
        outbound,
        Arc::clone(&config),
        session_id.clone(),
    ));
    let mut read_task = tokio::spawn(read_loop(stream, hub.clone(), config, session_id.clone()));

    // Wait for either task to finish, then abort the other.
    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    if hub.unregister(session_id.clone()).await.is_err() {
        tracing::debug!(session_id = %session_id, "hub already stopped");
    }
    tracing::info!(session_id = %session_id, "session disconnected");
}

/// Drains the outbound queue and sends keepalive pings.
///
/// Exits on the first write failure or deadline, or after sending a close
/// frame once the hub has closed the queue.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Utf8Bytes>,
    config: Arc<SessionConfig>,
    session_id: String,
) {
    let start = Instant::now() + config.ping_interval;
    let mut ping = tokio::time::interval_at(start, config.ping_interval);

    loop {
        let message = tokio::select! {
            frame = outbound.recv() => {
                let Some(text) = frame else {
                    tracing::debug!(session_id = %session_id, "outbound queue closed");
                    let _ = tokio::time::timeout(config.write_wait, sink.send(Message::Close(None))).await;
                    return;
                };
                Message::Text(text)
            }
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match tokio::time::timeout(config.write_wait, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(session_id = %session_id, error = %e, "write failed");
                return;
            }
            Err(_) => {
                tracing::warn!(session_id = %session_id, "write deadline exceeded");
                return;
            }
        }
    }
}

/// Reads inbound frames until failure, close, oversize, or pong timeout.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    hub: HubHandle,
    config: Arc<SessionConfig>,
    session_id: String,
) {
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let frame = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => {
                tracing::info!(session_id = %session_id, "pong deadline expired");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                tracing::debug!(session_id = %session_id, error = %e, "read failed");
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let payload: &[u8] = match &frame {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(data) => &data[..],
            Message::Pong(_) => {
                deadline = Instant::now() + config.pong_wait;
                continue;
            }
            Message::Ping(_) => continue,
            Message::Close(_) => {
                tracing::debug!(session_id = %session_id, "received close frame");
                return;
            }
        };

        if payload.len() > config.max_frame_size {
            tracing::warn!(
                session_id = %session_id,
                size = payload.len(),
                limit = config.max_frame_size,
                "oversized frame, closing session"
            );
            return;
        }

        let envelope = match codec::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "dropping malformed frame");
                continue;
            }
        };

        match admit(envelope, &session_id, config.relay_signaling) {
            Admission::Forward(envelope) => {
                if hub.broadcast(envelope).await.is_err() {
                    tracing::error!(session_id = %session_id, "hub unavailable, closing session");
                    return;
                }
            }
            Admission::Drop(DropReason::EmptyChat) => {}
            Admission::Drop(reason) => {
                tracing::debug!(session_id = %session_id, reason = %reason, "dropping envelope");
            }
        }
    }
}
