//! Dialing the targets named in inbound Connects

use async_trait::async_trait;
use dialback_proto::ConnectRequest;
use dialback_session::{ConnectHandler, DialError, Upstream};
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

use crate::access_control::AccessControl;

/// Dials `tcp`, `tcp4` and `tcp6` targets (and `unix` sockets on unix
/// hosts), subject to an [`AccessControl`]
#[derive(Debug, Clone, Default)]
pub struct TcpConnectHandler {
    access: AccessControl,
}

impl TcpConnectHandler {
    pub fn new(access: AccessControl) -> Self {
        Self { access }
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    async fn dial_tcp(&self, proto: &str, address: &str) -> Result<TcpStream, DialError> {
        let candidates: Vec<SocketAddr> = tokio::net::lookup_host(address)
            .await
            .map_err(|e| DialError::DialFailed(format!("resolve {}: {}", address, e)))?
            .filter(|addr| match proto {
                "tcp4" => addr.is_ipv4(),
                "tcp6" => addr.is_ipv6(),
                _ => true,
            })
            .collect();

        if candidates.is_empty() {
            return Err(DialError::DialFailed(format!(
                "no {} address for {}",
                proto, address
            )));
        }

        let mut last_error: Option<DialError> = None;
        for addr in candidates {
            if let Err(e) = self.access.check(&addr) {
                debug!(target_addr = %addr, error = %e, "Target denied");
                last_error = Some(DialError::DialFailed(e.to_string()));
                continue;
            }

            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(target_addr = %addr, "Connected to target");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(target_addr = %addr, error = %e, "Target dial failed");
                    last_error = Some(DialError::DialFailed(dial_error_text(addr, &e)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DialError::DialFailed(address.to_string())))
    }

    #[cfg(unix)]
    async fn dial_unix(&self, path: &str) -> Result<Upstream, DialError> {
        // Socket paths carry no address to check; only an open policy allows them
        if !self.access.is_unrestricted() {
            return Err(DialError::DialFailed(format!(
                "unix socket {} not allowed by access control",
                path
            )));
        }
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| DialError::DialFailed(format!("dial unix {}: {}", path, e)))?;
        Ok(Box::new(stream))
    }
}

fn dial_error_text(addr: SocketAddr, err: &io::Error) -> String {
    format!("dial tcp {}: {}", addr, err)
}

#[async_trait]
impl ConnectHandler for TcpConnectHandler {
    async fn connect(&self, request: &ConnectRequest) -> Result<Upstream, DialError> {
        match request.proto.as_str() {
            "tcp" | "tcp4" | "tcp6" => {
                let stream = self.dial_tcp(&request.proto, &request.address).await?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            "unix" => self.dial_unix(&request.address).await,
            other => Err(DialError::DialFailed(format!("unsupported protocol {}", other))),
        }
    }
}
