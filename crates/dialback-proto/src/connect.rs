//! Connect frame payload
//!
//! Text form: `<deadline_ms>/<proto>/<address>`. When a Connect is forwarded
//! to a peer server, `proto` is prefixed with the target client key:
//! `<client_key>::<proto>`.

use bytes::Bytes;
use std::time::Duration;

use crate::frame::FrameError;

const CLIENT_SEPARATOR: &str = "::";

/// Target of a logical connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// How long the accepting side may spend dialing the target
    pub deadline: Duration,
    pub proto: String,
    pub address: String,
}

impl ConnectRequest {
    pub fn new(proto: impl Into<String>, address: impl Into<String>, deadline: Duration) -> Self {
        Self {
            deadline,
            proto: proto.into(),
            address: address.into(),
        }
    }

    /// Request addressed to a client attached to a peer server
    pub fn for_client(
        client_key: &str,
        proto: &str,
        address: impl Into<String>,
        deadline: Duration,
    ) -> Self {
        Self::new(
            format!("{}{}{}", client_key, CLIENT_SEPARATOR, proto),
            address,
            deadline,
        )
    }

    /// Split a peer-addressed proto into `(client_key, proto)`
    pub fn client_target(&self) -> Option<(&str, &str)> {
        self.proto.split_once(CLIENT_SEPARATOR)
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(format!(
            "{}/{}/{}",
            self.deadline.as_millis(),
            self.proto,
            self.address
        ))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| FrameError::InvalidConnect(format!("not UTF-8: {}", e)))?;

        let mut parts = text.splitn(3, '/');
        let (Some(deadline), Some(proto), Some(address)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(FrameError::InvalidConnect(format!(
                "expected <deadline>/<proto>/<address>, got {:?}",
                text
            )));
        };

        let deadline_ms = deadline
            .parse::<u64>()
            .map_err(|e| FrameError::InvalidConnect(format!("bad deadline {:?}: {}", deadline, e)))?;

        if proto.is_empty() || address.is_empty() {
            return Err(FrameError::InvalidConnect(format!(
                "empty proto or address in {:?}",
                text
            )));
        }

        Ok(Self {
            deadline: Duration::from_millis(deadline_ms),
            proto: proto.to_string(),
            address: address.to_string(),
        })
    }
}

impl std::fmt::Display for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.proto, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_text_form() {
        let request = ConnectRequest::new("tcp", "10.0.0.5:80", Duration::from_millis(1500));
        assert_eq!(&request.encode()[..], b"1500/tcp/10.0.0.5:80");
    }

    #[test]
    fn test_address_may_contain_slashes() {
        let request = ConnectRequest::decode(b"100/unix//var/run/docker.sock").unwrap();
        assert_eq!(request.proto, "unix");
        assert_eq!(request.address, "/var/run/docker.sock");
    }

    #[test]
    fn test_peer_addressed_request() {
        let request =
            ConnectRequest::for_client("agent-1", "tcp", "10.0.0.5:80", Duration::from_secs(1));
        assert_eq!(request.proto, "agent-1::tcp");
        assert_eq!(request.client_target(), Some(("agent-1", "tcp")));

        let decoded = ConnectRequest::decode(&request.encode()).unwrap();
        assert_eq!(decoded.client_target(), Some(("agent-1", "tcp")));
    }

    #[test]
    fn test_plain_request_has_no_client_target() {
        let request = ConnectRequest::new("tcp", "127.0.0.1:22", Duration::from_secs(1));
        assert!(request.client_target().is_none());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(ConnectRequest::decode(b"tcp/10.0.0.5:80").is_err());
        assert!(ConnectRequest::decode(b"soon/tcp/10.0.0.5:80").is_err());
        assert!(ConnectRequest::decode(b"10//10.0.0.5:80").is_err());
        assert!(ConnectRequest::decode(&[0xff, 0xfe]).is_err());
    }
}
