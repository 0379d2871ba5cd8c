//! Shared protocol definitions for the Peerlink wire format.

pub mod codec;
pub mod envelope;
pub mod token;
