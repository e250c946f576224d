//! Multiplexing core for reverse-dial tunnels
//!
//! One [`Session`] owns one physical transport and carries any number of
//! logical connections over it. Each logical connection is exposed as a
//! [`MuxStream`], an ordinary `AsyncRead + AsyncWrite` byte stream.
//!
//! ```text
//!  SessionManager ── client key ──▶ Session ──▶ HeartbeatConn ──▶ transport
//!                                      │
//!                                      ├── id 1 ─ MuxStream
//!                                      ├── id 3 ─ MuxStream
//!                                      └── id 5 ─ MuxStream
//! ```
//!
//! A session dies as a whole when its transport stops proving liveness,
//! fails to decode, or closes; every logical connection on it then reports
//! an error. Closing a single logical connection never affects the others.

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod manager;
pub mod metrics;
pub mod session;

pub use config::{ConfigError, SessionConfig};
pub use connection::{ConnState, MuxStream};
pub use error::{DialError, HeartbeatError, SessionError};
pub use handler::{bridge, ConnectHandler, PeerDialHandler, Upstream, UpstreamIo};
pub use heartbeat::HeartbeatConn;
pub use manager::{ClientDirectory, SessionManager, WeakSessionManager};
pub use metrics::{MetricEvent, MetricsSink, NoopMetrics, PrometheusMetrics, RecordingMetrics};
pub use session::{Role, Session, SessionBuilder};
