//! Local TCP listeners whose connections are tunneled through a client
//!
//! Spec format: `<listen>=<client_key>/<proto>/<address>`, for example
//! `127.0.0.1:2222=foo/tcp/10.0.0.5:22`.

use dialback_session::SessionManager;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ServerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub listen: SocketAddr,
    pub client_key: String,
    pub proto: String,
    pub address: String,
}

impl FromStr for ForwardSpec {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            ServerError::InvalidForward(format!(
                "{:?}: {}, expected <listen>=<client_key>/<proto>/<address>",
                s, reason
            ))
        };

        let (listen, target) = s.split_once('=').ok_or_else(|| invalid("missing '='"))?;
        let listen = listen
            .trim()
            .parse::<SocketAddr>()
            .map_err(|e| invalid(&e.to_string()))?;

        let mut parts = target.splitn(3, '/');
        let (Some(client_key), Some(proto), Some(address)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("missing target parts"));
        };
        if client_key.is_empty() || proto.is_empty() || address.is_empty() {
            return Err(invalid("empty target part"));
        }

        Ok(Self {
            listen,
            client_key: client_key.to_string(),
            proto: proto.to_string(),
            address: address.to_string(),
        })
    }
}

impl std::fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}={}/{}/{}",
            self.listen, self.client_key, self.proto, self.address
        )
    }
}

/// A bound forward listener
pub struct Forwarder {
    spec: ForwardSpec,
    listener: TcpListener,
    manager: SessionManager,
}

impl Forwarder {
    pub async fn bind(spec: ForwardSpec, manager: SessionManager) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(spec.listen)
            .await
            .map_err(|e| ServerError::BindError {
                address: spec.listen,
                reason: e.to_string(),
            })?;
        Ok(Self {
            spec,
            listener,
            manager,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            listen = ?self.listener.local_addr().ok(),
            client_key = %self.spec.client_key,
            target = %format!("{}://{}", self.spec.proto, self.spec.address),
            "Forward listener started"
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted forward connection from {}", peer_addr);
                    let manager = self.manager.clone();
                    let spec = self.spec.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forward_connection(socket, &manager, &spec).await {
                            warn!(
                                peer_addr = %peer_addr,
                                client_key = %spec.client_key,
                                error = %e,
                                "Forward connection failed"
                            );
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept forward connection: {}", e);
                }
            }
        }

        info!(client_key = %self.spec.client_key, "Forward listener stopped");
    }
}

async fn forward_connection(
    mut socket: TcpStream,
    manager: &SessionManager,
    spec: &ForwardSpec,
) -> Result<(), ServerError> {
    let mut stream = manager
        .dial(&spec.client_key, &spec.proto, &spec.address)
        .await?;
    let _ = socket.set_nodelay(true);

    let (to_target, to_local) = tokio::io::copy_bidirectional(&mut socket, &mut stream).await?;
    debug!(
        client_key = %spec.client_key,
        connection_id = stream.id(),
        bytes_to_target = to_target,
        bytes_to_local = to_local,
        "Forward connection finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forward_spec() {
        let spec: ForwardSpec = "127.0.0.1:2222=foo/tcp/10.0.0.5:22".parse().unwrap();
        assert_eq!(spec.listen, "127.0.0.1:2222".parse().unwrap());
        assert_eq!(spec.client_key, "foo");
        assert_eq!(spec.proto, "tcp");
        assert_eq!(spec.address, "10.0.0.5:22");
        assert_eq!(spec.to_string(), "127.0.0.1:2222=foo/tcp/10.0.0.5:22");
    }

    #[test]
    fn test_address_keeps_slashes() {
        let spec: ForwardSpec = "127.0.0.1:2375=foo/unix//var/run/docker.sock".parse().unwrap();
        assert_eq!(spec.proto, "unix");
        assert_eq!(spec.address, "/var/run/docker.sock");
    }

    #[test]
    fn test_rejects_malformed_specs() {
        for bad in [
            "127.0.0.1:2222",
            "localhost=foo/tcp/10.0.0.5:22",
            "127.0.0.1:2222=foo/tcp",
            "127.0.0.1:2222=/tcp/10.0.0.5:22",
        ] {
            assert!(bad.parse::<ForwardSpec>().is_err(), "{}", bad);
        }
    }
}
