//! Error types for sessions, dials and the heartbeat wrapper

use dialback_proto::FrameError;
use dialback_transport::TransportError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failures of the heartbeat-wrapped transport
#[derive(Debug, Error)]
pub enum HeartbeatError {
    /// No liveness event arrived in time, or a write outlived the
    /// connection-level write deadline
    #[error("No liveness event within {0:?}")]
    Timeout(Duration),

    /// A write passed its caller-supplied deadline; the write itself may
    /// still complete in the background
    #[error("Write deadline exceeded")]
    WriteTimeout,

    #[error("Transport closed")]
    Closed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HeartbeatError {
    /// Whether this error ends the whole session
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HeartbeatError::WriteTimeout)
    }
}

/// Why a session ended
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Heartbeat failed: {0}")]
    Heartbeat(String),

    #[error("Frame decode failed: {0}")]
    Decode(#[from] FrameError),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Replaced by a newer session for the same client")]
    Replaced,

    #[error("Session shut down")]
    Shutdown,
}

impl From<&HeartbeatError> for SessionError {
    fn from(err: &HeartbeatError) -> Self {
        match err {
            HeartbeatError::Closed | HeartbeatError::Transport(TransportError::Closed) => {
                SessionError::TransportClosed
            }
            other => SessionError::Heartbeat(other.to_string()),
        }
    }
}

/// Dial failures, distinguishable so callers can decide whether to retry
/// elsewhere
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("No session for client {0}")]
    NotFound(String),

    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session closed")]
    SessionClosed,
}

impl From<DialError> for io::Error {
    fn from(err: DialError) -> Self {
        let kind = match err {
            DialError::NotFound(_) => io::ErrorKind::NotFound,
            DialError::DialFailed(_) => io::ErrorKind::ConnectionRefused,
            DialError::Timeout(_) => io::ErrorKind::TimedOut,
            DialError::SessionClosed => io::ErrorKind::ConnectionAborted,
        };
        io::Error::new(kind, err)
    }
}

pub(crate) fn write_io_error(err: HeartbeatError) -> io::Error {
    match err {
        HeartbeatError::WriteTimeout => {
            io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")
        }
        other => io::Error::new(io::ErrorKind::BrokenPipe, other),
    }
}
