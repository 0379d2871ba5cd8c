//! Peerlink relay server library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! accepts WebSocket connections, assigns each one an ephemeral session id,
//! and broadcasts every admitted envelope to all live sessions.

pub mod config;
pub mod hub;
pub mod server;
pub mod session;
