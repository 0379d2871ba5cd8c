//! Peerlink client library.
//!
//! A client connects to the relay, learns its ephemeral id from the welcome
//! frame, and exchanges chat and probe envelopes with every other client.
//! In peer-to-peer mode it also negotiates a direct data channel to each
//! peer it discovers, using the relay only to carry signaling.

pub mod client;
pub mod config;
pub mod input;
pub mod log;
pub mod orchestrator;
pub mod peers;
pub mod probe;
pub mod relay;
pub mod rtc;
