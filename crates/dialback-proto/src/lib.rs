//! Dialback wire protocol
//!
//! This crate defines the frames exchanged between a server and its agents
//! over one physical transport, and the payload carried by Connect frames.
//!
//! Every physical-transport message carries exactly one frame:
//!
//! ```text
//! +----------------------+--------+---------------------+
//! | connection id (u64)  | kind   | payload             |
//! | 8 bytes, big-endian  | 1 byte | rest of the message |
//! +----------------------+--------+---------------------+
//! ```
//!
//! There is no length prefix: the transport already delivers whole messages.

pub mod connect;
pub mod frame;

pub use connect::ConnectRequest;
pub use frame::{Frame, FrameError, FrameKind};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame header size: connection id (8) + kind (1)
pub const HEADER_SIZE: usize = 9;

/// Maximum payload carried by a single frame (16MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Connection id used by frames that are not bound to a logical connection
/// (client announcements).
pub const CONTROL_CONNECTION_ID: u64 = 0;

/// Header carrying the client key of an agent transport
pub const TUNNEL_ID_HEADER: &str = "X-Tunnel-ID";

/// Header carrying the id of a peer server opening a peer link
pub const PEER_ID_HEADER: &str = "X-API-Tunnel-Peer-ID";

/// Header carrying the shared secret of a peer link
pub const PEER_TOKEN_HEADER: &str = "X-API-Tunnel-Token";
