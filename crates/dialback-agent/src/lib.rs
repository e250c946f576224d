//! Agent side of a dialback tunnel
//!
//! An agent keeps a session open to its server and dials, on the server's
//! behalf, the targets named in inbound Connects.

pub mod access_control;
pub mod client;
pub mod dialer;

pub use access_control::{AccessControl, AccessControlError, PortRange};
pub use client::{Agent, AgentConfig, AgentError};
pub use dialer::TcpConnectHandler;
