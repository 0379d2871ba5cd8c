//! Bounded, observable message log.
//!
//! Everything the client shows the user goes through here: relayed chat,
//! direct messages, connection notices, and probe results. Subscribers get
//! an [`LogEvent`] for every append and for every probe status change.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::broadcast;

use crate::peers::PeerId;
use crate::probe::ProbeRoute;

/// Capacity of the subscriber channel. Slow subscribers skip events.
const EVENT_BUFFER: usize = 256;

/// Stable handle to a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    /// Wraps a raw entry number.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Resolution of a probe entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Waiting for the echo.
    Pending,
    /// The echo arrived after `latency`.
    Acknowledged {
        /// Measured round trip.
        latency: Duration,
    },
    /// The path went away before the echo arrived.
    Canceled,
}

/// What an entry records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// A chat line received through the relay.
    Chat {
        /// Sender session id.
        from: String,
        /// Message text.
        text: String,
    },
    /// A chat line over a direct channel.
    Direct {
        /// The other end of the channel.
        peer: PeerId,
        /// Message text.
        text: String,
        /// `true` if this client sent it.
        outbound: bool,
    },
    /// Connection lifecycle notice.
    System(String),
    /// Informational notice about a local action.
    Info(String),
    /// A latency probe.
    Probe {
        /// Route the probe took.
        route: ProbeRoute,
        /// Correlation id.
        id: String,
        /// Current resolution.
        status: ProbeStatus,
    },
}

/// One log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Handle for later updates.
    pub id: EntryId,
    /// Local time the entry was appended.
    pub at: DateTime<Local>,
    /// Content.
    pub kind: EntryKind,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.at.format("%H:%M:%S"))?;
        match &self.kind {
            EntryKind::Chat { from, text } => write!(f, "<{from}> {text}"),
            EntryKind::Direct {
                peer,
                text,
                outbound: true,
            } => write!(f, "-> [{peer}] {text}"),
            EntryKind::Direct { peer, text, .. } => write!(f, "<- [{peer}] {text}"),
            EntryKind::System(text) => write!(f, "*** {text}"),
            EntryKind::Info(text) => write!(f, "-- {text}"),
            EntryKind::Probe { route, id, status } => match status {
                ProbeStatus::Pending => write!(f, "ping {route} ({id}) ..."),
                ProbeStatus::Acknowledged { latency } => {
                    write!(f, "ping {route} ({id}) {} ms", latency.as_millis())
                }
                ProbeStatus::Canceled => write!(f, "ping {route} ({id}) canceled"),
            },
        }
    }
}

/// Change notification published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A new entry was added.
    Appended(LogEntry),
    /// An existing entry changed (probe resolution).
    Updated(LogEntry),
}

/// The bounded log. Oldest entries are evicted first.
#[derive(Debug)]
pub struct MessageLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_id: u64,
    events: broadcast::Sender<LogEvent>,
}

impl MessageLog {
    /// Creates an empty log holding at most `capacity` entries (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            next_id: 0,
            events,
        }
    }

    /// Sender half of the event channel, for handing out subscriptions.
    #[must_use]
    pub fn event_sender(&self) -> broadcast::Sender<LogEvent> {
        self.events.clone()
    }

    /// Subscribes to future appends and updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    /// Appends an entry and notifies subscribers.
    pub fn append(&mut self, kind: EntryKind) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        let entry = LogEntry {
            id,
            at: Local::now(),
            kind,
        };
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());
        // No subscribers is fine.
        let _ = self.events.send(LogEvent::Appended(entry));
        id
    }

    /// Shorthand for appending a [`EntryKind::System`] notice.
    pub fn system(&mut self, text: impl Into<String>) -> EntryId {
        self.append(EntryKind::System(text.into()))
    }

    /// Shorthand for appending an [`EntryKind::Info`] notice.
    pub fn info(&mut self, text: impl Into<String>) -> EntryId {
        self.append(EntryKind::Info(text.into()))
    }

    /// Moves a pending probe entry to `status`.
    ///
    /// Returns `false` if the entry was evicted, is not a probe, or has
    /// already been resolved.
    pub fn resolve_probe(&mut self, id: EntryId, status: ProbeStatus) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) else {
            return false;
        };
        let EntryKind::Probe {
            status: current, ..
        } = &mut entry.kind
        else {
            return false;
        };
        if *current != ProbeStatus::Pending {
            return false;
        }
        *current = status;
        let _ = self.events.send(LogEvent::Updated(entry.clone()));
        true
    }

    /// Looks up an entry that has not been evicted.
    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<&LogEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Entries from oldest to newest.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been logged (or everything evicted).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
