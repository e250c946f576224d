//! WebSocket listener and connector implementations

use dialback_proto::{PEER_ID_HEADER, PEER_TOKEN_HEADER, TUNNEL_ID_HEADER};
use dialback_transport::{AcceptedTransport, Identity, Transport, TransportError, TransportResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::WebSocketConfig;
use crate::connection::into_transport;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Completed handshakes waiting for `accept`
const ACCEPT_BACKLOG: usize = 64;

/// WebSocket listener for accepting agent and peer transports
///
/// TLS and WebSocket handshakes run in their own tasks, so a client that
/// connects and then stalls never delays anyone else's handshake.
pub struct WebSocketListener {
    tcp_listener: TcpListener,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    config: Arc<WebSocketConfig>,
    ready_tx: mpsc::Sender<AcceptedTransport>,
    ready_rx: Mutex<mpsc::Receiver<AcceptedTransport>>,
}

impl std::fmt::Debug for WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .field("tls", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl WebSocketListener {
    pub async fn bind(bind_addr: SocketAddr, config: Arc<WebSocketConfig>) -> TransportResult<Self> {
        config.validate()?;

        let tls_acceptor = config.build_tls_acceptor()?;
        let tcp_listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            TransportError::ConnectionError(format!("Failed to bind {}: {}", bind_addr, e))
        })?;

        let local_addr = tcp_listener.local_addr()?;
        let scheme = if tls_acceptor.is_some() { "wss" } else { "ws" };
        info!(
            "WebSocket listener bound to {}://{}{}",
            scheme, local_addr, config.path
        );

        let (ready_tx, ready_rx) = mpsc::channel(ACCEPT_BACKLOG);
        Ok(Self {
            tcp_listener,
            tls_acceptor,
            config,
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.tcp_listener
            .local_addr()
            .map_err(TransportError::IoError)
    }

    /// Accept the next transport whose handshake succeeds
    ///
    /// Failed TLS or WebSocket handshakes are logged and skipped; only a
    /// failure of the listening socket itself is returned. Cancel safe.
    pub async fn accept(&self) -> TransportResult<AcceptedTransport> {
        let mut ready_rx = self.ready_rx.lock().await;
        loop {
            tokio::select! {
                Some(accepted) = ready_rx.recv() => return Ok(accepted),
                incoming = self.tcp_listener.accept() => {
                    let (tcp_stream, remote_addr) = incoming.map_err(TransportError::IoError)?;
                    debug!("Incoming TCP connection from {}", remote_addr);
                    tokio::spawn(establish(
                        tcp_stream,
                        remote_addr,
                        self.tls_acceptor.clone(),
                        self.config.clone(),
                        self.ready_tx.clone(),
                    ));
                }
            }
        }
    }
}

/// Run the handshakes for one TCP connection and queue the transport
async fn establish(
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    config: Arc<WebSocketConfig>,
    ready_tx: mpsc::Sender<AcceptedTransport>,
) {
    let accepted = match tls_acceptor {
        Some(acceptor) => {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp_stream)).await {
                Ok(Ok(tls_stream)) => handshake(tls_stream, remote_addr, &config).await,
                Ok(Err(e)) => {
                    warn!("TLS handshake failed from {}: {}", remote_addr, e);
                    return;
                }
                Err(_) => {
                    warn!("TLS handshake timed out from {}", remote_addr);
                    return;
                }
            }
        }
        None => handshake(tcp_stream, remote_addr, &config).await,
    };

    match accepted {
        Ok(accepted) => {
            info!(
                "WebSocket transport established from {} ({})",
                remote_addr, accepted.identity
            );
            if ready_tx.send(accepted).await.is_err() {
                debug!("Listener closed before {} was accepted", remote_addr);
            }
        }
        Err(e) => {
            warn!("WebSocket handshake failed from {}: {}", remote_addr, e);
        }
    }
}

async fn handshake<S>(
    stream: S,
    remote_addr: SocketAddr,
    config: &WebSocketConfig,
) -> TransportResult<AcceptedTransport>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut identity = None;
    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        identity = Some(identify(req, config)?);
        Ok(response)
    };

    let ws_stream = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            callback,
            Some(config.protocol_config()),
        ),
    )
    .await
    .map_err(|_| TransportError::Timeout)?
    .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let identity = identity.ok_or_else(|| {
        TransportError::Handshake("handshake completed without an identity".to_string())
    })?;

    Ok(AcceptedTransport {
        transport: into_transport(ws_stream, Some(remote_addr)),
        identity,
    })
}

/// Decide who is connecting from the upgrade request headers
fn identify(req: &Request, config: &WebSocketConfig) -> Result<Identity, ErrorResponse> {
    let path = req.uri().path();
    if path != config.path && path.trim_end_matches('/') != config.path {
        return Err(reject(StatusCode::NOT_FOUND, "unknown path"));
    }

    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    if let Some(peer_id) = header(PEER_ID_HEADER) {
        let Some(expected) = config.peer_token.as_deref() else {
            return Err(reject(StatusCode::UNAUTHORIZED, "peer links are disabled"));
        };
        if header(PEER_TOKEN_HEADER) != Some(expected) {
            return Err(reject(StatusCode::UNAUTHORIZED, "invalid peer token"));
        }
        return Ok(Identity::Peer(peer_id.to_string()));
    }

    match header(TUNNEL_ID_HEADER) {
        Some(key) => Ok(Identity::Client(key.to_string())),
        None => Err(reject(
            StatusCode::BAD_REQUEST,
            "missing X-Tunnel-ID header",
        )),
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// WebSocket connector for dialing a server
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: Arc<WebSocketConfig>,
}

impl WebSocketConnector {
    pub fn new(config: Arc<WebSocketConfig>) -> Self {
        Self { config }
    }

    /// Open a transport to `url`, presenting `identity` in the handshake
    ///
    /// `peer_token` is only sent for [`Identity::Peer`].
    pub async fn connect(
        &self,
        url: &str,
        identity: &Identity,
        peer_token: Option<&str>,
    ) -> TransportResult<Transport> {
        let parsed = Url::parse(url)
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL {}: {}", url, e)))?;
        let secure = match parsed.scheme() {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(TransportError::ConfigurationError(format!(
                    "Unsupported scheme {}, expected ws or wss",
                    other
                )))
            }
        };

        let mut request = parsed
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
        let headers = request.headers_mut();
        match identity {
            Identity::Client(key) => {
                headers.insert(TUNNEL_ID_HEADER, header_value(key)?);
            }
            Identity::Peer(id) => {
                headers.insert(PEER_ID_HEADER, header_value(id)?);
                if let Some(token) = peer_token {
                    headers.insert(PEER_TOKEN_HEADER, header_value(token)?);
                }
            }
        }

        debug!("Connecting to {} as {}", parsed, identity);

        let connector = secure.then(|| self.config.client_connector());
        let (ws_stream, _response) = tokio_tungstenite::connect_async_tls_with_config(
            request,
            Some(self.config.protocol_config()),
            false,
            connector,
        )
        .await
        .map_err(|e| match e {
            WsError::Http(response) => TransportError::Handshake(format!(
                "server answered {}",
                response.status()
            )),
            WsError::Io(e) => TransportError::ConnectionError(e.to_string()),
            other => TransportError::ConnectionError(other.to_string()),
        })?;

        let remote_addr = match ws_stream.get_ref() {
            MaybeTlsStream::Plain(stream) => stream.peer_addr().ok(),
            MaybeTlsStream::Rustls(stream) => stream.get_ref().0.peer_addr().ok(),
            _ => None,
        };

        info!("Connected to {} as {}", parsed, identity);
        Ok(into_transport(ws_stream, remote_addr))
    }
}

fn header_value(value: &str) -> TransportResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::ConfigurationError(format!("Invalid header value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialback_transport::Message;
    use tokio_tungstenite::tungstenite::http;

    fn request(path: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = http::Request::builder().uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_identify_client() {
        let config = WebSocketConfig::default();
        let req = request("/connect", &[(TUNNEL_ID_HEADER, "agent-1")]);

        assert_eq!(
            identify(&req, &config).unwrap(),
            Identity::Client("agent-1".to_string())
        );
    }

    #[test]
    fn test_identify_requires_tunnel_id() {
        let config = WebSocketConfig::default();
        let err = identify(&request("/connect", &[]), &config).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = identify(&request("/elsewhere", &[(TUNNEL_ID_HEADER, "a")]), &config).unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_identify_peer_checks_token() {
        let config = WebSocketConfig::default().with_peer_token("secret");

        let ok = request(
            "/connect",
            &[(PEER_ID_HEADER, "server-b"), (PEER_TOKEN_HEADER, "secret")],
        );
        assert_eq!(
            identify(&ok, &config).unwrap(),
            Identity::Peer("server-b".to_string())
        );

        let wrong = request(
            "/connect",
            &[(PEER_ID_HEADER, "server-b"), (PEER_TOKEN_HEADER, "guess")],
        );
        assert_eq!(
            identify(&wrong, &config).unwrap_err().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_peer_links_disabled_without_token() {
        let config = WebSocketConfig::default();
        let req = request(
            "/connect",
            &[(PEER_ID_HEADER, "server-b"), (PEER_TOKEN_HEADER, "anything")],
        );
        assert_eq!(
            identify(&req, &config).unwrap_err().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_connect_and_accept_over_loopback() {
        let config = Arc::new(WebSocketConfig::default());
        let listener = WebSocketListener::bind("127.0.0.1:0".parse().unwrap(), config.clone())
            .await
            .unwrap();
        let url = format!("ws://{}/connect", listener.local_addr().unwrap());

        let accept = tokio::spawn(async move { listener.accept().await });

        let connector = WebSocketConnector::new(config);
        let mut client = connector
            .connect(&url, &Identity::Client("agent-1".to_string()), None)
            .await
            .unwrap();

        let mut accepted = accept.await.unwrap().unwrap();
        assert_eq!(accepted.identity, Identity::Client("agent-1".to_string()));

        client
            .sink
            .send(Message::Binary(bytes::Bytes::from_static(b"hello")))
            .await
            .unwrap();
        assert_eq!(
            accepted.transport.source.next_message().await.unwrap(),
            Some(Message::Binary(bytes::Bytes::from_static(b"hello")))
        );
    }

    #[tokio::test]
    async fn test_stalled_handshake_does_not_block_accept() {
        let config = Arc::new(WebSocketConfig::default());
        let listener = WebSocketListener::bind("127.0.0.1:0".parse().unwrap(), config.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("ws://{}/connect", addr);

        // Connects but never sends an upgrade request
        let _stalled = tokio::net::TcpStream::connect(addr).await.unwrap();

        let accept = tokio::spawn(async move { listener.accept().await });
        let connector = WebSocketConnector::new(config);
        let _client = connector
            .connect(&url, &Identity::Client("agent-2".to_string()), None)
            .await
            .unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(2), accept)
            .await
            .expect("accept waited on the stalled handshake")
            .unwrap()
            .unwrap();
        assert_eq!(accepted.identity, Identity::Client("agent-2".to_string()));
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let connector = WebSocketConnector::new(Arc::new(WebSocketConfig::default()));
        let result = connector
            .connect("http://localhost/connect", &Identity::Client("a".to_string()), None)
            .await;
        assert!(matches!(result, Err(TransportError::ConfigurationError(_))));
    }
}
