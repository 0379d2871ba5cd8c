//! Opaque identifiers and timestamps shared by the relay and its clients.

use std::fmt::Write as _;

use chrono::{SecondsFormat, Utc};

/// Number of random bytes behind every token.
pub const TOKEN_BYTES: usize = 8;

/// Generates a fresh random token: 8 bytes rendered as 16 lowercase hex digits.
///
/// Used for session ids, envelope ids and probe correlation ids.
#[must_use]
pub fn new_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    bytes.iter().fold(String::with_capacity(TOKEN_BYTES * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Current UTC time in RFC 3339 form with sub-second precision.
#[must_use]
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
