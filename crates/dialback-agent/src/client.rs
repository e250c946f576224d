//! The agent's connection to its server
//!
//! The agent dials the server, presents its client key, and serves the
//! Connects that arrive over the resulting session. When the session dies
//! it dials again with exponential backoff.

use dialback_session::{ConnectHandler, MetricsSink, NoopMetrics, Role, Session, SessionConfig};
use dialback_transport::{
    Identity, ReconnectConfig, ReconnectError, ReconnectManager, TransportError,
};
use dialback_transport_websocket::{WebSocketConfig, WebSocketConnector};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    GaveUp(#[from] ReconnectError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server endpoint, e.g. `ws://localhost:8123/connect`
    pub server_url: String,

    /// Key this agent registers under
    pub client_key: String,

    pub session: SessionConfig,

    pub websocket: WebSocketConfig,

    pub reconnect: ReconnectConfig,
}

impl AgentConfig {
    pub fn new(server_url: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            client_key: client_key.into(),
            session: SessionConfig::default(),
            websocket: WebSocketConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.client_key.is_empty() {
            return Err(AgentError::InvalidConfig("client key cannot be empty".to_string()));
        }
        self.session
            .validate()
            .map_err(|e| AgentError::InvalidConfig(e.to_string()))?;
        self.websocket.validate()?;
        Ok(())
    }
}

pub struct Agent {
    config: AgentConfig,
    connector: WebSocketConnector,
    handler: Arc<dyn ConnectHandler>,
    metrics: Arc<dyn MetricsSink>,
}

impl Agent {
    pub fn new(config: AgentConfig, handler: Arc<dyn ConnectHandler>) -> Result<Self, AgentError> {
        config.validate()?;
        let connector = WebSocketConnector::new(Arc::new(config.websocket.clone()));
        Ok(Self {
            config,
            connector,
            handler,
            metrics: Arc::new(NoopMetrics),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn client_key(&self) -> &str {
        &self.config.client_key
    }

    /// Dial the server once and start serving the session
    pub async fn connect(&self) -> Result<Session, AgentError> {
        let identity = Identity::Client(self.config.client_key.clone());
        let transport = self
            .connector
            .connect(&self.config.server_url, &identity, None)
            .await?;

        let session = Session::builder(self.config.client_key.clone())
            .role(Role::Client)
            .config(self.config.session.clone())
            .metrics(self.metrics.clone())
            .connect_handler(self.handler.clone())
            .start(transport);
        Ok(session)
    }

    /// Keep a session to the server alive until `shutdown` fires
    ///
    /// Returns an error only when the reconnect policy gives up.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                attempt = self.connect() => attempt,
            };

            match attempt {
                Ok(session) => {
                    info!(
                        client_key = %self.config.client_key,
                        server = %self.config.server_url,
                        session_id = session.id(),
                        "Connected to server"
                    );
                    reconnect.reset();

                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            session.close();
                            info!(client_key = %self.config.client_key, "Agent stopped");
                            return Ok(());
                        }
                        _ = session.closed() => {}
                    }

                    warn!(
                        client_key = %self.config.client_key,
                        reason = ?session.close_reason(),
                        "Session to server ended"
                    );
                }
                Err(AgentError::Transport(TransportError::Handshake(reason))) => {
                    error!(
                        client_key = %self.config.client_key,
                        server = %self.config.server_url,
                        reason = %reason,
                        "Server rejected the agent"
                    );
                }
                Err(e) => {
                    warn!(
                        client_key = %self.config.client_key,
                        server = %self.config.server_url,
                        error = %e,
                        "Failed to connect to server"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                waited = reconnect.wait() => waited?,
            }
        }
    }
}
