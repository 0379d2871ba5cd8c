//! Hub: the single owner of the live session set.
//!
//! All membership changes and broadcasts are serialized through one task
//! that owns a [`Hub`]. Sessions talk to it through a cloneable
//! [`HubHandle`]. The hub never waits on a client: every delivery is a
//! non-blocking `try_send` onto the session's bounded queue, and a session
//! whose queue is full or closed is dropped on the spot.

use std::collections::HashMap;

use axum::extract::ws::Utf8Bytes;
use peerlink_proto::codec;
use peerlink_proto::envelope::Envelope;
use peerlink_proto::token;
use tokio::sync::{mpsc, oneshot};

/// Capacity of the command queue feeding the hub task.
const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Sender half of a session's bounded outbound queue.
pub type SessionQueue = mpsc::Sender<Utf8Bytes>;

/// Error returned when the hub task is no longer running.
#[derive(Debug, thiserror::Error)]
#[error("hub task has stopped")]
pub struct HubStopped;

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Number of sessions the frame was queued for.
    pub delivered: usize,
    /// Sessions that were dropped because their queue was full or closed.
    pub dropped: Vec<String>,
}

/// The live session set. Owned by exactly one task.
#[derive(Debug, Default)]
pub struct Hub {
    sessions: HashMap<String, SessionQueue>,
}

impl Hub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session. A previous queue under the same id is dropped.
    pub fn register(&mut self, id: String, queue: SessionQueue) {
        if self.sessions.insert(id.clone(), queue).is_some() {
            tracing::warn!(session_id = %id, "replaced existing session queue");
        }
        tracing::debug!(session_id = %id, live = self.sessions.len(), "session registered");
    }

    /// Removes a session if present, closing its outbound queue.
    ///
    /// Returns `true` if the session was live.
    pub fn unregister(&mut self, id: &str) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            tracing::debug!(session_id = %id, live = self.sessions.len(), "session unregistered");
        }
        removed
    }

    /// Stamps `serverTime`, encodes once, and queues the frame for every
    /// live session. Slow or closed sessions are removed.
    pub fn broadcast(&mut self, mut envelope: Envelope) -> BroadcastReport {
        envelope.server_time = Some(token::timestamp_now());
        let frame: Utf8Bytes = match codec::encode(&envelope) {
            Ok(text) => text.into(),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode broadcast envelope");
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport::default();
        for (id, queue) in &self.sessions {
            match queue.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(session_id = %id, "outbound queue full, dropping slow session");
                    report.dropped.push(id.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    report.dropped.push(id.clone());
                }
            }
        }
        for id in &report.dropped {
            self.sessions.remove(id);
        }
        report
    }

    /// Ids of every live session, sorted.
    #[must_use]
    pub fn members(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops every queue. Each session writer then sends a close frame.
    pub fn close_all(&mut self) {
        for id in self.sessions.keys() {
            tracing::info!(session_id = %id, "closing session");
        }
        self.sessions.clear();
    }

    fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { id, queue } => self.register(id, queue),
            HubCommand::Unregister { id } => {
                self.unregister(&id);
            }
            HubCommand::Broadcast(envelope) => {
                let report = self.broadcast(envelope);
                tracing::trace!(
                    delivered = report.delivered,
                    dropped = report.dropped.len(),
                    "broadcast"
                );
            }
            HubCommand::Members(reply) => {
                let _ = reply.send(self.members());
            }
            HubCommand::CloseAll => self.close_all(),
        }
    }
}

enum HubCommand {
    Register { id: String, queue: SessionQueue },
    Unregister { id: String },
    Broadcast(Envelope),
    Members(oneshot::Sender<Vec<String>>),
    CloseAll,
}

/// Cloneable handle to the hub task.
///
/// The task exits once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl std::fmt::Debug for HubCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register { id, .. } => f.debug_struct("Register").field("id", id).finish(),
            Self::Unregister { id } => f.debug_struct("Unregister").field("id", id).finish(),
            Self::Broadcast(envelope) => f.debug_tuple("Broadcast").field(&envelope.kind).finish(),
            Self::Members(_) => f.write_str("Members"),
            Self::CloseAll => f.write_str("CloseAll"),
        }
    }
}

/// Spawns the hub task and returns a handle to it.
#[must_use]
pub fn spawn() -> HubHandle {
    let (commands, mut inbox) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    tokio::spawn(async move {
        let mut hub = Hub::new();
        while let Some(command) = inbox.recv().await {
            hub.apply(command);
        }
        tracing::debug!("hub task stopped");
    });
    HubHandle { commands }
}

impl HubHandle {
    async fn send(&self, command: HubCommand) -> Result<(), HubStopped> {
        self.commands.send(command).await.map_err(|_| HubStopped)
    }

    /// Adds a session and its outbound queue to the live set.
    ///
    /// # Errors
    ///
    /// Returns [`HubStopped`] if the hub task has exited.
    pub async fn register(&self, id: String, queue: SessionQueue) -> Result<(), HubStopped> {
        self.send(HubCommand::Register { id, queue }).await
    }

    /// Removes a session. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`HubStopped`] if the hub task has exited.
    pub async fn unregister(&self, id: String) -> Result<(), HubStopped> {
        self.send(HubCommand::Unregister { id }).await
    }

    /// Broadcasts an admitted envelope to every live session.
    ///
    /// # Errors
    ///
    /// Returns [`HubStopped`] if the hub task has exited.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<(), HubStopped> {
        self.send(HubCommand::Broadcast(envelope)).await
    }

    /// Snapshot of the live session ids, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`HubStopped`] if the hub task has exited.
    pub async fn members(&self) -> Result<Vec<String>, HubStopped> {
        let (reply, response) = oneshot::channel();
        self.send(HubCommand::Members(reply)).await?;
        response.await.map_err(|_| HubStopped)
    }

    /// Closes every session's queue so each writer sends a close frame.
    ///
    /// # Errors
    ///
    /// Returns [`HubStopped`] if the hub task has exited.
    pub async fn close_all(&self) -> Result<(), HubStopped> {
        self.send(HubCommand::CloseAll).await
    }
}
