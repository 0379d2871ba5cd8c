//! Wire envelope exchanged over the relay and over direct peer channels.
//!
//! Every frame is one JSON object. Only `type` is required; every other field
//! is optional and omitted from the encoded form when absent. Field spellings
//! follow the browser conventions (`sentAt`, `serverTime`, `sdpMLineIndex`).

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The `type` discriminator of an [`Envelope`].
///
/// Unrecognized strings decode to [`EnvelopeKind::Unknown`] instead of
/// failing, so newer peers can introduce types without breaking older relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// User chat line.
    Chat,
    /// Server-originated notice (the welcome frame).
    System,
    /// Latency probe.
    Ping,
    /// Asks every other client to announce itself.
    PresenceRequest,
    /// Announcement in reply to a presence request.
    Presence,
    /// Session description offer.
    Offer,
    /// Session description answer.
    Answer,
    /// One trickled network candidate.
    IceCandidate,
    /// Any type this version does not know.
    Unknown,
}

impl EnvelopeKind {
    /// Returns `true` for the offer/answer/candidate exchange.
    #[must_use]
    pub const fn is_signaling(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }

    /// Returns `true` for the types that only peers act on (presence and
    /// signaling). The relay forwards these opaquely when enabled.
    #[must_use]
    pub const fn is_peer_protocol(self) -> bool {
        matches!(self, Self::PresenceRequest | Self::Presence) || self.is_signaling()
    }

    /// Wire spelling of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::System => "system",
            Self::Ping => "ping",
            Self::PresenceRequest => "presence-request",
            Self::Presence => "presence",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Unknown => "unknown",
        }
    }

    /// Parses a wire spelling; anything unrecognized maps to `Unknown`.
    #[must_use]
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "chat" => Self::Chat,
            "system" => Self::System,
            "ping" => Self::Ping,
            "presence-request" => Self::PresenceRequest,
            "presence" => Self::Presence,
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "ice-candidate" => Self::IceCandidate,
            _ => Self::Unknown,
        }
    }
}

impl Serialize for EnvelopeKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EnvelopeKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Cow::<'de, str>::deserialize(deserializer)?;
        Ok(Self::from_wire(&raw))
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A trickled ICE candidate, spelled like the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The `candidate:` attribute line.
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Creates a candidate with only the attribute line set.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// One self-describing message unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Chat or system text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Correlation token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Client-side send time, opaque to the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    /// Relay broadcast time (RFC 3339, UTC). Overwritten by the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<String>,
    /// Originating session id. Overwritten by the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Intended recipient. Advisory: the relay still broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Raw session description for offers and answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    /// Trickled candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl Envelope {
    /// Creates an envelope of the given kind with every optional field empty.
    #[must_use]
    pub const fn new(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            text: None,
            id: None,
            sent_at: None,
            server_time: None,
            sender: None,
            target: None,
            sdp: None,
            candidate: None,
        }
    }

    /// A chat line.
    pub fn chat(text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Chat).with_text(text)
    }

    /// A server notice.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::System).with_text(text)
    }

    /// A latency probe carrying its correlation id and send time.
    pub fn ping(id: impl Into<String>, sent_at: impl Into<String>) -> Self {
        let mut envelope = Self::new(EnvelopeKind::Ping).with_id(id);
        envelope.sent_at = Some(sent_at.into());
        envelope
    }

    /// A presence request broadcast.
    #[must_use]
    pub const fn presence_request() -> Self {
        Self::new(EnvelopeKind::PresenceRequest)
    }

    /// A presence announcement addressed to `target`.
    pub fn presence(target: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Presence).with_target(target)
    }

    /// An offer addressed to `target`.
    pub fn offer(target: impl Into<String>, sdp: impl Into<String>) -> Self {
        let mut envelope = Self::new(EnvelopeKind::Offer).with_target(target);
        envelope.sdp = Some(sdp.into());
        envelope
    }

    /// An answer addressed to `target`.
    pub fn answer(target: impl Into<String>, sdp: impl Into<String>) -> Self {
        let mut envelope = Self::new(EnvelopeKind::Answer).with_target(target);
        envelope.sdp = Some(sdp.into());
        envelope
    }

    /// A trickled candidate addressed to `target`.
    pub fn ice_candidate(target: impl Into<String>, candidate: IceCandidate) -> Self {
        let mut envelope = Self::new(EnvelopeKind::IceCandidate).with_target(target);
        envelope.candidate = Some(candidate);
        envelope
    }

    /// Sets `text`.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Sets `id`.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets `sender`.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Sets `target`.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Returns `true` if `sender` equals `id`.
    #[must_use]
    pub fn is_from(&self, id: &str) -> bool {
        self.sender.as_deref() == Some(id)
    }

    /// Returns `true` if `target` equals `id`.
    #[must_use]
    pub fn is_addressed_to(&self, id: &str) -> bool {
        self.target.as_deref() == Some(id)
    }

    /// The correlation id, treating an empty string as absent.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}
