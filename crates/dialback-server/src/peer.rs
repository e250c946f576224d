//! Outbound links to peer servers
//!
//! Each configured peer gets one long-lived task that dials it, presents
//! our peer id and token, and hands the resulting session to the manager.
//! Client keys the peer announces over the link become dialable here.

use dialback_session::{Role, Session, SessionConfig, SessionManager};
use dialback_transport::{Identity, ReconnectConfig, ReconnectManager};
use dialback_transport_websocket::WebSocketConnector;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ServerError;

/// A peer to link to: `<id>=<url>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: String,
    pub url: String,
}

impl FromStr for PeerConfig {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((id, url)) if !id.is_empty() && !url.is_empty() => Ok(Self {
                id: id.to_string(),
                url: url.to_string(),
            }),
            _ => Err(ServerError::InvalidPeer(format!(
                "{:?}, expected <peer_id>=<ws url>",
                s
            ))),
        }
    }
}

pub struct PeerLink {
    pub(crate) local_id: String,
    pub(crate) token: String,
    pub(crate) peer: PeerConfig,
    pub(crate) connector: WebSocketConnector,
    pub(crate) session_config: SessionConfig,
    pub(crate) reconnect: ReconnectConfig,
    pub(crate) manager: SessionManager,
}

impl PeerLink {
    /// Keep the link to this peer up until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) {
        let metrics = self.manager.metrics();
        let identity = Identity::Peer(self.local_id.clone());
        let mut reconnect = ReconnectManager::new(self.reconnect.clone());

        loop {
            metrics.peer_attempt(&self.peer.id);
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => return,
                attempt = self.connector.connect(&self.peer.url, &identity, Some(&self.token)) => attempt,
            };

            match attempt {
                Ok(transport) => {
                    metrics.peer_connected(&self.peer.id);
                    let session = Session::builder(self.peer.id.clone())
                        .role(Role::Client)
                        .peer(true)
                        .config(self.session_config.clone())
                        .metrics(metrics.clone())
                        .client_directory(Arc::new(self.manager.downgrade()))
                        .start(transport);
                    self.manager.add_peer_session(&self.peer.id, session.clone());
                    info!(peer_id = %self.peer.id, url = %self.peer.url, "Peer link up");
                    reconnect.reset();

                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            session.close();
                            return;
                        }
                        _ = session.closed() => {}
                    }

                    metrics.peer_disconnected(&self.peer.id);
                    warn!(
                        peer_id = %self.peer.id,
                        reason = ?session.close_reason(),
                        "Peer link down"
                    );
                }
                Err(e) => {
                    warn!(peer_id = %self.peer.id, url = %self.peer.url, error = %e, "Failed to connect to peer");
                }
            }

            let waited = tokio::select! {
                _ = shutdown.cancelled() => return,
                waited = reconnect.wait() => waited,
            };
            if let Err(e) = waited {
                warn!(peer_id = %self.peer.id, error = %e, "Giving up on peer");
                return;
            }
        }
    }
}
