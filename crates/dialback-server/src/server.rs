//! Transport accept loop and the wiring around it

use dialback_session::{
    DialError, MetricsSink, NoopMetrics, PeerDialHandler, Role, Session, SessionConfig,
    SessionManager,
};
use dialback_transport::{AcceptedTransport, Identity, ReconnectConfig, TransportError};
use dialback_transport_websocket::{WebSocketConfig, WebSocketConnector, WebSocketListener};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::forward::{ForwardSpec, Forwarder};
use crate::peer::{PeerConfig, PeerLink};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: SocketAddr, reason: String },

    #[error("Invalid forward: {0}")]
    InvalidForward(String),

    #[error("Invalid peer: {0}")]
    InvalidPeer(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,

    pub websocket: WebSocketConfig,

    pub session: SessionConfig,

    /// Our id when linking to peers; peer links are only dialed when set
    pub peer_id: Option<String>,

    /// Peers to link to
    pub peers: Vec<PeerConfig>,

    pub peer_reconnect: ReconnectConfig,

    pub forwards: Vec<ForwardSpec>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8123)),
            websocket: WebSocketConfig::default(),
            session: SessionConfig::default(),
            peer_id: None,
            peers: Vec::new(),
            peer_reconnect: ReconnectConfig::default(),
            forwards: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ServerError> {
        self.session
            .validate()
            .map_err(|e| ServerError::InvalidConfig(e.to_string()))?;
        self.websocket.validate()?;

        if !self.peers.is_empty() {
            if self.peer_id.as_deref().map_or(true, str::is_empty) {
                return Err(ServerError::InvalidConfig(
                    "peers configured without a peer id".to_string(),
                ));
            }
            if self.websocket.peer_token.is_none() {
                return Err(ServerError::InvalidConfig(
                    "peers configured without a peer token".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Accepts agent and peer transports, keeps peer links up and serves the
/// configured forward listeners
pub struct Server {
    config: ServerConfig,
    listener: WebSocketListener,
    manager: SessionManager,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        Self::bind_with_metrics(config, Arc::new(NoopMetrics)).await
    }

    pub async fn bind_with_metrics(
        config: ServerConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let listener =
            WebSocketListener::bind(config.listen, Arc::new(config.websocket.clone())).await?;
        Ok(Self {
            config,
            listener,
            manager: SessionManager::new(metrics),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Serve until `shutdown` fires, then close every session
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        for spec in &self.config.forwards {
            let forwarder = Forwarder::bind(spec.clone(), self.manager.clone()).await?;
            tokio::spawn(forwarder.run(shutdown.child_token()));
        }

        if let (Some(local_id), Some(token)) =
            (&self.config.peer_id, &self.config.websocket.peer_token)
        {
            let connector = WebSocketConnector::new(Arc::new(self.config.websocket.clone()));
            for peer in &self.config.peers {
                let link = PeerLink {
                    local_id: local_id.clone(),
                    token: token.clone(),
                    peer: peer.clone(),
                    connector: connector.clone(),
                    session_config: self.config.session.clone(),
                    reconnect: self.config.peer_reconnect.clone(),
                    manager: self.manager.clone(),
                };
                tokio::spawn(link.run(shutdown.child_token()));
            }
        }

        info!("Server listening on {}", self.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok(accepted) => self.attach(accepted),
                Err(e) => {
                    error!("Failed to accept transport: {}", e);
                }
            }
        }

        info!("Server shutting down");
        self.manager.shutdown();
        Ok(())
    }

    fn attach(&self, accepted: AcceptedTransport) {
        let remote_addr = accepted.transport.remote_addr;
        match accepted.identity {
            Identity::Client(client_key) => {
                info!(client_key = %client_key, remote_addr = ?remote_addr, "Agent connected");
                let session = Session::builder(client_key.clone())
                    .role(Role::Server)
                    .config(self.config.session.clone())
                    .metrics(self.manager.metrics())
                    .start(accepted.transport);
                self.manager.register(&client_key, session);
            }
            Identity::Peer(peer_id) => {
                info!(peer_id = %peer_id, remote_addr = ?remote_addr, "Peer connected");
                let session = Session::builder(peer_id.clone())
                    .role(Role::Server)
                    .peer(true)
                    .config(self.config.session.clone())
                    .metrics(self.manager.metrics())
                    .connect_handler(Arc::new(PeerDialHandler::new(self.manager.downgrade())))
                    .start(accepted.transport);
                self.manager.register_peer_listener(&peer_id, session);
            }
        }
    }
}
