//! WebSocket transport implementation using tokio-tungstenite
//!
//! Agents open one long-lived WebSocket to the server and keep it up; the
//! session layer multiplexes every logical connection over it. The
//! handshake carries the caller's identity in request headers:
//!
//! - `X-Tunnel-ID: <client key>` for agents
//! - `X-API-Tunnel-Peer-ID: <server id>` plus `X-API-Tunnel-Token` for peer
//!   links between server instances
//!
//! Every binary WebSocket message carries exactly one encoded frame; ping
//! and pong control messages are surfaced to the session's heartbeat.

pub mod config;
pub mod connection;
pub mod listener;

pub use config::WebSocketConfig;
pub use connection::{into_transport, WebSocketSink, WebSocketSource};
pub use listener::{WebSocketConnector, WebSocketListener};
