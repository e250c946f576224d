//! Dialback CLI - reverse-dial tunnels
//!
//! `dialback server` accepts agents and dials through them; `dialback agent`
//! connects to a server and dials targets on its behalf.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialback_agent::{AccessControl, Agent, AgentConfig, PortRange, TcpConnectHandler};
use dialback_server::{ForwardSpec, PeerConfig, Server, ServerConfig};
use dialback_session::metrics::{LIVENESS_BUCKETS, SECONDS_ELAPSED_AFTER_PONG_OR_ERR};
use dialback_session::{MetricsSink, NoopMetrics, PrometheusMetrics, SessionConfig};
use dialback_transport::ReconnectConfig;
use dialback_transport_websocket::WebSocketConfig;
use ipnet::IpNet;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dialback - reach services behind NAT through agents that dial out
#[derive(Parser, Debug)]
#[command(name = "dialback")]
#[command(version = concat!(env!("GIT_TAG"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_TIME"), ")"))]
struct Cli {
    /// Enable verbose logging (ignored when RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agents and tunnel connections through them
    #[command(long_about = r#"
Accept agent connections and open connections through them.

EXAMPLES:
  # Accept agents on the default port
  dialback server --listen 0.0.0.0:8123

  # Expose port 22 of 10.0.0.5, as seen by agent "foo", on local port 2222
  dialback server --forward 127.0.0.1:2222=foo/tcp/10.0.0.5:22

  # Link two servers so agents attached to either are reachable from both
  dialback server --peer-id west --peer-token $TOKEN --peer east=ws://east:8123/connect

ENVIRONMENT VARIABLES:
  DIALBACK_LISTEN      Listen address
  DIALBACK_PEER_ID     This server's peer id
  DIALBACK_PEER_TOKEN  Shared peer token
    "#)]
    Server(ServerArgs),

    /// Connect to a server and dial targets on its behalf
    #[command(long_about = r#"
Connect to a server and dial the targets it asks for. Automatically
reconnects if the connection drops.

EXAMPLES:
  dialback agent --connect ws://localhost:8123/connect --id foo

  # Only allow SSH and HTTPS inside 10.0.0.0/8
  dialback agent --id foo --allow-cidr 10.0.0.0/8 --allow-port 22 --allow-port 443

ENVIRONMENT VARIABLES:
  DIALBACK_CONNECT  Server URL
  DIALBACK_ID       Client key to register under
    "#)]
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Seconds without any liveness event before a session is dropped
    #[arg(long, env = "DIALBACK_PING_WAIT", default_value = "60")]
    ping_wait: u64,

    /// Seconds between pings sent by this side (0 = never ping)
    #[arg(long, env = "DIALBACK_PING_INTERVAL", default_value = "5")]
    ping_interval: u64,

    /// Seconds a dial may take before it is abandoned
    #[arg(long, env = "DIALBACK_DIAL_TIMEOUT", default_value = "60")]
    dial_timeout: u64,

    /// Seconds a single frame write may take (0 = wait for the transport)
    #[arg(long, env = "DIALBACK_WRITE_TIMEOUT", default_value = "0")]
    write_timeout: u64,

    /// Bytes buffered per connection before the sender is paused
    #[arg(long, env = "DIALBACK_MAX_BUFFER", default_value = "2097152")]
    max_buffer: usize,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "DIALBACK_METRICS_LISTEN")]
    metrics_listen: Option<SocketAddr>,
}

impl SessionArgs {
    fn session_config(&self) -> SessionConfig {
        let ping_interval = (self.ping_interval > 0).then(|| Duration::from_secs(self.ping_interval));
        let write_timeout = (self.write_timeout > 0).then(|| Duration::from_secs(self.write_timeout));
        SessionConfig::default()
            .with_ping_wait(Duration::from_secs(self.ping_wait))
            .with_ping_interval(ping_interval)
            .with_dial_timeout(Duration::from_secs(self.dial_timeout))
            .with_write_timeout(write_timeout)
            .with_max_buffer(self.max_buffer)
    }
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to accept agents and peers on
    #[arg(long, env = "DIALBACK_LISTEN", default_value = "0.0.0.0:8123")]
    listen: SocketAddr,

    /// WebSocket upgrade path
    #[arg(long, env = "DIALBACK_PATH", default_value = "/connect")]
    path: String,

    /// TLS certificate (PEM); serves wss:// together with --key
    #[arg(long, env = "DIALBACK_CERT", requires = "key")]
    cert: Option<std::path::PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "DIALBACK_KEY", requires = "cert")]
    key: Option<std::path::PathBuf>,

    /// This server's id when linking to peers
    #[arg(long, env = "DIALBACK_PEER_ID")]
    peer_id: Option<String>,

    /// Shared secret for peer links, both directions
    #[arg(long, env = "DIALBACK_PEER_TOKEN")]
    peer_token: Option<String>,

    /// Peer to link to, as <peer_id>=<ws url> (repeatable)
    #[arg(long = "peer")]
    peers: Vec<PeerConfig>,

    /// Forward a local port through a client, as
    /// <listen>=<client_key>/<proto>/<address> (repeatable)
    #[arg(long = "forward")]
    forwards: Vec<ForwardSpec>,

    /// Skip certificate verification when dialing wss:// peers (insecure)
    #[arg(long)]
    insecure: bool,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Server URL
    #[arg(long, env = "DIALBACK_CONNECT", default_value = "ws://localhost:8123/connect")]
    connect: String,

    /// Client key to register under
    #[arg(long, env = "DIALBACK_ID", default_value = "foo")]
    id: String,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Only dial targets inside this CIDR range (repeatable)
    #[arg(long = "allow-cidr")]
    allow_cidrs: Vec<IpNet>,

    /// Only dial these ports, e.g. 22 or 8000-8100 (repeatable)
    #[arg(long = "allow-port")]
    allow_ports: Vec<PortRange>,

    /// Maximum consecutive reconnection attempts (0 = infinite)
    #[arg(long, default_value = "0")]
    max_reconnect_attempts: usize,

    /// Initial reconnection delay in seconds
    #[arg(long, default_value = "1")]
    reconnect_delay: u64,

    /// Maximum reconnection delay in seconds
    #[arg(long, default_value = "60")]
    max_reconnect_delay: u64,

    #[command(flatten)]
    session: SessionArgs,
}

/// Setup logging: RUST_LOG wins, otherwise the verbosity flag decides
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Install the Prometheus exporter when asked to and pick the metrics sink
fn setup_metrics(listen: Option<SocketAddr>) -> Result<Arc<dyn MetricsSink>> {
    let Some(listen) = listen else {
        return Ok(Arc::new(NoopMetrics));
    };

    PrometheusBuilder::new()
        .with_http_listener(listen)
        .set_buckets_for_metric(
            Matcher::Full(SECONDS_ELAPSED_AFTER_PONG_OR_ERR.to_string()),
            LIVENESS_BUCKETS,
        )
        .context("Invalid histogram buckets")?
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics available on http://{}/metrics", listen);
    Ok(Arc::new(PrometheusMetrics::new()))
}

/// Cancel `shutdown` on Ctrl+C
fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
        }
        shutdown.cancel();
    });
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let mut websocket = WebSocketConfig::default().with_path(&args.path);
    if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        websocket = websocket.with_tls(cert, key);
    }
    if let Some(token) = &args.peer_token {
        websocket = websocket.with_peer_token(token.clone());
    }
    if args.insecure {
        warn!("Certificate verification disabled for peer links (insecure mode)");
        websocket = websocket.with_insecure_skip_verify();
    }

    let config = ServerConfig {
        listen: args.listen,
        websocket,
        session: args.session.session_config(),
        peer_id: args.peer_id,
        peers: args.peers,
        peer_reconnect: ReconnectConfig::default(),
        forwards: args.forwards,
    };

    let metrics = setup_metrics(args.session.metrics_listen)?;
    let server = Server::bind_with_metrics(config, metrics)
        .await
        .context("Failed to start server")?;

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    server.run(shutdown).await.context("Server failed")?;

    info!("Dialback server stopped");
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let mut websocket = WebSocketConfig::default();
    if args.insecure {
        warn!("Certificate verification disabled (insecure mode)");
        websocket = websocket.with_insecure_skip_verify();
    }

    let max_attempts = (args.max_reconnect_attempts > 0).then_some(args.max_reconnect_attempts);
    let config = AgentConfig {
        server_url: args.connect.clone(),
        client_key: args.id.clone(),
        session: args.session.session_config(),
        websocket,
        reconnect: ReconnectConfig::from_secs(args.reconnect_delay, args.max_reconnect_delay)
            .with_max_attempts(max_attempts),
    };

    let access = AccessControl::new(args.allow_cidrs, args.allow_ports);
    if access.is_unrestricted() {
        warn!("No --allow-cidr or --allow-port given; the server may dial any target");
    }

    info!("Client key: {}", args.id);
    info!("Server: {}", args.connect);

    let metrics = setup_metrics(args.session.metrics_listen)?;
    let agent = Agent::new(config, Arc::new(TcpConnectHandler::new(access)))
        .context("Failed to create agent")?
        .with_metrics(metrics);

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    agent.run(shutdown).await.context("Agent failed")?;

    info!("Dialback agent stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Agent(args) => run_agent(args).await,
    }
}
