//! JSON text encoding for [`Envelope`] frames.
//!
//! Each WebSocket text frame or data-channel message carries exactly one
//! envelope. Decoding is strict about JSON shape but lenient about the
//! `type` value, which falls back to [`EnvelopeKind::Unknown`](crate::envelope::EnvelopeKind::Unknown).

use crate::envelope::Envelope;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The input was not a JSON object of envelope shape.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The input was not valid UTF-8.
    #[error("envelope is not valid UTF-8")]
    NotUtf8,
}

/// Encodes an [`Envelope`] as a compact JSON string.
///
/// # Errors
///
/// Returns `CodecError::Malformed` if the envelope cannot be serialized.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decodes an [`Envelope`] from JSON text.
///
/// # Errors
///
/// Returns `CodecError::Malformed` if the text is not a JSON object with a
/// string `type` field, or if a known field has the wrong JSON type.
pub fn decode_str(text: &str) -> Result<Envelope, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Decodes an [`Envelope`] from raw bytes.
///
/// # Errors
///
/// Returns `CodecError::NotUtf8` for invalid UTF-8 and otherwise the same
/// errors as [`decode_str`].
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CodecError::NotUtf8)?;
    decode_str(text)
}
