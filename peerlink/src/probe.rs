//! Round-trip latency probes.
//!
//! A relay probe is a `ping` the relay broadcasts back to its sender. A
//! direct probe is a `ping` sent over a peer's data channel; the peer
//! reflects it unchanged and the originator recognizes its own id. Each
//! pending probe is resolved exactly once: acknowledged when the echo
//! arrives, or canceled when the path it was sent on goes away.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::log::EntryId;
use crate::peers::PeerId;

/// Path a probe travels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeRoute {
    /// Through the relay and back.
    Relay,
    /// Over the direct channel to a peer and back.
    Direct(PeerId),
}

impl fmt::Display for ProbeRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => f.write_str("relay"),
            Self::Direct(peer) => write!(f, "direct:{peer}"),
        }
    }
}

/// A probe waiting for its echo.
#[derive(Debug, Clone)]
struct PendingProbe {
    started_at: Instant,
    entry: EntryId,
}

/// A probe whose echo arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledged {
    /// Log entry displaying the probe.
    pub entry: EntryId,
    /// Time from send to echo.
    pub latency: Duration,
}

/// Pending relay and direct probes, keyed by correlation id.
///
/// An id is pending in at most one of the two tables.
#[derive(Debug, Default)]
pub struct ProbeTracker {
    relay: HashMap<String, PendingProbe>,
    direct: HashMap<String, (PeerId, PendingProbe)>,
}

impl ProbeTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts timing a probe. Returns `false` (and records nothing) if `id`
    /// is already pending on either route.
    pub fn start(&mut self, route: ProbeRoute, id: impl Into<String>, entry: EntryId) -> bool {
        let id = id.into();
        if self.relay.contains_key(&id) || self.direct.contains_key(&id) {
            return false;
        }
        let probe = PendingProbe {
            started_at: Instant::now(),
            entry,
        };
        match route {
            ProbeRoute::Relay => {
                self.relay.insert(id, probe);
            }
            ProbeRoute::Direct(peer) => {
                self.direct.insert(id, (peer, probe));
            }
        }
        true
    }

    /// Resolves a relay probe whose echo arrived.
    pub fn acknowledge_relay(&mut self, id: &str) -> Option<Acknowledged> {
        self.relay.remove(id).map(PendingProbe::acknowledge)
    }

    /// Resolves a direct probe reflected by `peer`.
    ///
    /// An echo from a different peer than the probe was sent to is ignored.
    pub fn acknowledge_direct(&mut self, peer: &PeerId, id: &str) -> Option<Acknowledged> {
        match self.direct.get(id) {
            Some((target, _)) if target == peer => {}
            _ => return None,
        }
        self.direct
            .remove(id)
            .map(|(_, probe)| probe.acknowledge())
    }

    /// Cancels every pending relay probe, returning their log entries.
    pub fn cancel_relay(&mut self) -> Vec<EntryId> {
        self.relay.drain().map(|(_, probe)| probe.entry).collect()
    }

    /// Cancels every pending direct probe to `peer`.
    pub fn cancel_direct(&mut self, peer: &PeerId) -> Vec<EntryId> {
        let mut canceled = Vec::new();
        self.direct.retain(|_, (target, probe)| {
            if target == peer {
                canceled.push(probe.entry);
                false
            } else {
                true
            }
        });
        canceled
    }

    /// Cancels a single probe on either route.
    pub fn cancel(&mut self, id: &str) -> Option<EntryId> {
        self.relay
            .remove(id)
            .or_else(|| self.direct.remove(id).map(|(_, probe)| probe))
            .map(|probe| probe.entry)
    }

    /// Cancels everything.
    pub fn cancel_all(&mut self) -> Vec<EntryId> {
        let mut canceled = self.cancel_relay();
        canceled.extend(self.direct.drain().map(|(_, (_, probe))| probe.entry));
        canceled
    }

    /// Number of relay probes in flight.
    #[must_use]
    pub fn pending_relay(&self) -> usize {
        self.relay.len()
    }

    /// Number of direct probes in flight.
    #[must_use]
    pub fn pending_direct(&self) -> usize {
        self.direct.len()
    }
}

impl PendingProbe {
    fn acknowledge(self) -> Acknowledged {
        Acknowledged {
            entry: self.entry,
            latency: self.started_at.elapsed(),
        }
    }
}
