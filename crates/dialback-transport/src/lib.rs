//! Transport abstraction for dialback sessions
//!
//! A session runs over one physical transport: an already-established,
//! message-oriented, full-duplex connection such as a WebSocket. This crate
//! defines the two halves the session needs and nothing about how the
//! transport was negotiated.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            dialback-session (heartbeat, mux)             │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ MessageSink / MessageSource
//!                           ↓
//! ┌──────────────────────────────┬──────────────────────────┐
//! │ dialback-transport-websocket │ memory (tests, embedding) │
//! └──────────────────────────────┴──────────────────────────┘
//! ```

pub mod memory;
pub mod reconnect;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// One message of the physical transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Application payload (one encoded frame)
    Binary(Bytes),
    /// Liveness probe; the receiver answers with a Pong
    Ping(Bytes),
    /// Answer to a Ping
    Pong(Bytes),
    /// The peer is closing the transport
    Close,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Binary(_) => "binary",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Close => "close",
        }
    }
}

/// Write half of a physical transport
#[async_trait]
pub trait MessageSink: Send + Debug {
    /// Send one whole message
    async fn send(&mut self, message: Message) -> TransportResult<()>;

    /// Close the transport; further sends fail
    async fn close(&mut self) -> TransportResult<()>;
}

/// Read half of a physical transport
#[async_trait]
pub trait MessageSource: Send + Debug {
    /// Receive the next whole message
    ///
    /// Returns `None` once the transport has ended.
    async fn next_message(&mut self) -> TransportResult<Option<Message>>;
}

/// Who is on the other end of a physical transport
///
/// Supplied out-of-band when the transport is established (request
/// headers for WebSocket) and treated as an opaque registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// An agent identified by its client key
    Client(String),
    /// Another server instance opening a peer link
    Peer(String),
}

impl Identity {
    pub fn key(&self) -> &str {
        match self {
            Identity::Client(key) | Identity::Peer(key) => key,
        }
    }

    pub fn is_peer(&self) -> bool {
        matches!(self, Identity::Peer(_))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::Client(key) => write!(f, "client {}", key),
            Identity::Peer(id) => write!(f, "peer {}", id),
        }
    }
}

/// An established physical transport
#[derive(Debug)]
pub struct Transport {
    /// Stable identifier for logging
    pub connection_id: String,
    pub remote_addr: Option<SocketAddr>,
    pub sink: Box<dyn MessageSink>,
    pub source: Box<dyn MessageSource>,
}

impl Transport {
    pub fn new(
        sink: impl MessageSink + 'static,
        source: impl MessageSource + 'static,
    ) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            remote_addr: None,
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = connection_id.into();
        self
    }

    pub fn with_remote_addr(mut self, remote_addr: SocketAddr) -> Self {
        self.remote_addr = Some(remote_addr);
        self
    }
}

/// A transport accepted by a listener, together with the identity its
/// handshake presented
#[derive(Debug)]
pub struct AcceptedTransport {
    pub transport: Transport,
    pub identity: Identity,
}
