//! Server side of a dialback tunnel
//!
//! Agents connect in and register under their client key; the server then
//! dials through them. Servers may also link to each other so that a client
//! attached to one is reachable from the others.

pub mod forward;
pub mod peer;
pub mod server;

pub use forward::{ForwardSpec, Forwarder};
pub use peer::{PeerConfig, PeerLink};
pub use server::{Server, ServerConfig, ServerError};
