//! Passive peer discovery.
//!
//! Every relayed envelope names its sender, so the client learns who else is
//! connected simply by watching traffic. The registry only grows; it is
//! cleared when the relay hands out a new local id, because the old peer ids
//! are meaningless after that.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;

/// A relay session id naming a remote client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Wraps a session id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The set of peers seen on the relay.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    known: BTreeSet<PeerId>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `sender` unless it is empty or equal to `self_id`.
    ///
    /// Returns `true` if the peer was not known before.
    pub fn observe(&mut self, sender: &str, self_id: Option<&str>) -> bool {
        if sender.is_empty() || self_id == Some(sender) {
            return false;
        }
        if self.known.contains(sender) {
            return false;
        }
        self.known.insert(PeerId::new(sender))
    }

    /// Returns `true` if `peer` has been seen.
    #[must_use]
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.known.contains(peer)
    }

    /// Forgets every peer.
    pub fn reset(&mut self) {
        self.known.clear();
    }

    /// Known peers in id order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerId> {
        self.known.iter()
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Returns `true` if no peer has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}
