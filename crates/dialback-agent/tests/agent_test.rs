//! Agent against a real WebSocket listener

use dialback_agent::{AccessControl, Agent, AgentConfig, PortRange, TcpConnectHandler};
use dialback_session::{DialError, Role, Session, SessionConfig, SessionManager};
use dialback_transport::Identity;
use dialback_transport_websocket::{WebSocketConfig, WebSocketListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

async fn echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Accept agents on a fresh listener and register them with `manager`
async fn serve(manager: SessionManager) -> String {
    let config = Arc::new(WebSocketConfig::default());
    let listener = WebSocketListener::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap();
    let url = format!("ws://{}/connect", listener.local_addr().unwrap());

    tokio::spawn(async move {
        while let Ok(accepted) = listener.accept().await {
            let Identity::Client(key) = accepted.identity else {
                continue;
            };
            let session = Session::builder(key.clone())
                .role(Role::Server)
                .config(SessionConfig::default().with_ping_interval(None))
                .start(accepted.transport);
            manager.register(&key, session);
        }
    });
    url
}

async fn wait_for(manager: &SessionManager, key: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !manager.has_session(key) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent never registered");
}

#[tokio::test]
async fn test_server_dials_through_agent() {
    let target = echo_server().await;
    let manager = SessionManager::default();
    let url = serve(manager.clone()).await;

    let agent = Agent::new(
        AgentConfig::new(url, "foo"),
        Arc::new(TcpConnectHandler::default()),
    )
    .unwrap();
    let shutdown = CancellationToken::new();
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    wait_for(&manager, "foo").await;
    let mut stream = manager
        .dial("foo", "tcp", &target.to_string())
        .await
        .unwrap();

    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 18];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");

    shutdown.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_denied_target_fails_the_dial() {
    let target = echo_server().await;
    let manager = SessionManager::default();
    let url = serve(manager.clone()).await;

    let access = AccessControl::new(vec!["10.0.0.0/8".parse().unwrap()], vec![PortRange::single(22)]);
    let agent = Agent::new(
        AgentConfig::new(url, "locked"),
        Arc::new(TcpConnectHandler::new(access)),
    )
    .unwrap();
    let shutdown = CancellationToken::new();
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    wait_for(&manager, "locked").await;
    let err = manager
        .dial("locked", "tcp", &target.to_string())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, DialError::DialFailed(reason) if reason.contains("not in allowed CIDR ranges")),
        "{:?}",
        err
    );

    shutdown.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_agent_reconnects_after_session_loss() {
    let manager = SessionManager::default();
    let url = serve(manager.clone()).await;

    let mut config = AgentConfig::new(url, "flaky");
    config.reconnect.initial_backoff = Duration::from_millis(10);
    let agent = Agent::new(config, Arc::new(TcpConnectHandler::default())).unwrap();
    let shutdown = CancellationToken::new();
    let running = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    wait_for(&manager, "flaky").await;
    let first = manager.session("flaky").unwrap();
    first.close();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(current) = manager.session("flaky") {
                if !current.same_session(&first) {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent never came back");

    shutdown.cancel();
    running.await.unwrap().unwrap();
}
