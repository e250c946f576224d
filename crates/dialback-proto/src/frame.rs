//! Multiplexed frames and their byte-exact encoding

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::connect::ConnectRequest;
use crate::{CONTROL_CONNECTION_ID, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Frame kinds carried in the one-byte tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// A chunk of stream bytes
    Data = 1,
    /// Open a logical connection; payload is a [`ConnectRequest`]
    Connect = 2,
    /// Abort a logical connection; payload is a UTF-8 reason
    Error = 3,
    /// Announce a client key reachable through the sender
    AddClient = 4,
    /// Withdraw a previously announced client key
    RemoveClient = 5,
    /// Ask the receiver to stop sending Data for this id
    Pause = 6,
    /// Lift a previous Pause
    Resume = 7,
    /// The sender will write no more data for this id
    Close = 8,
    /// The Connect for this id was accepted
    Connected = 9,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Data => "data",
            FrameKind::Connect => "connect",
            FrameKind::Error => "error",
            FrameKind::AddClient => "add_client",
            FrameKind::RemoveClient => "remove_client",
            FrameKind::Pause => "pause",
            FrameKind::Resume => "resume",
            FrameKind::Close => "close",
            FrameKind::Connected => "connected",
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Connect),
            3 => Ok(FrameKind::Error),
            4 => Ok(FrameKind::AddClient),
            5 => Ok(FrameKind::RemoveClient),
            6 => Ok(FrameKind::Pause),
            7 => Ok(FrameKind::Resume),
            8 => Ok(FrameKind::Close),
            9 => Ok(FrameKind::Connected),
            _ => Err(FrameError::UnknownKind(value)),
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Truncated frame: {len} bytes is shorter than the frame header")]
    Truncated { len: usize },

    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid connect payload: {0}")]
    InvalidConnect(String),
}

/// One unit on the wire: which logical connection, what happened, and the bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub connection_id: u64,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(connection_id: u64, kind: FrameKind, payload: Bytes) -> Self {
        Self {
            connection_id,
            kind,
            payload,
        }
    }

    pub fn connect(connection_id: u64, request: &ConnectRequest) -> Self {
        Self::new(connection_id, FrameKind::Connect, request.encode())
    }

    pub fn connected(connection_id: u64) -> Self {
        Self::new(connection_id, FrameKind::Connected, Bytes::new())
    }

    pub fn data(connection_id: u64, payload: Bytes) -> Self {
        Self::new(connection_id, FrameKind::Data, payload)
    }

    pub fn error(connection_id: u64, reason: &str) -> Self {
        Self::new(
            connection_id,
            FrameKind::Error,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn close(connection_id: u64) -> Self {
        Self::new(connection_id, FrameKind::Close, Bytes::new())
    }

    pub fn pause(connection_id: u64) -> Self {
        Self::new(connection_id, FrameKind::Pause, Bytes::new())
    }

    pub fn resume(connection_id: u64) -> Self {
        Self::new(connection_id, FrameKind::Resume, Bytes::new())
    }

    pub fn add_client(client_key: &str) -> Self {
        Self::new(
            CONTROL_CONNECTION_ID,
            FrameKind::AddClient,
            Bytes::copy_from_slice(client_key.as_bytes()),
        )
    }

    pub fn remove_client(client_key: &str) -> Self {
        Self::new(
            CONTROL_CONNECTION_ID,
            FrameKind::RemoveClient,
            Bytes::copy_from_slice(client_key.as_bytes()),
        )
    }

    /// Payload interpreted as text (Error reasons, client keys)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encode frame to a transport message body
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len);
        buf.put_u64(self.connection_id);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Decode frame from a transport message body
    ///
    /// Everything after the header is payload; nothing is ever truncated.
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::Truncated { len: buf.len() });
        }

        let connection_id = buf.get_u64();
        let kind = FrameKind::try_from(buf.get_u8())?;

        if buf.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(buf.len()));
        }

        Ok(Self {
            connection_id,
            kind,
            payload: buf,
        })
    }
}
