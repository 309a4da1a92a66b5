//! Room-scoped WebRTC signaling relay — WebSocket message broker.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay server operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Wire-level message model for the signaling protocol.
pub mod protocol;
/// Room-scoped registry of connected peers.
pub mod registry;
/// Inbound dispatch, peer-list broadcast, and session lifecycle.
pub mod router;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
