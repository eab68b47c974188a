//! Real-time signaling for a user's devices: a WebSocket hub that tracks which
//! devices each identity has online, fans presence events out to siblings, and
//! relays WebRTC offers, answers and ICE candidates between them.

pub mod auth;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod directory;
pub mod hub;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod telemetry;
