//! Shared helpers: a hand-driven remote end speaking raw frames

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dialback_proto::{ConnectRequest, Frame, FrameKind};
use dialback_session::{ConnectHandler, DialError, MuxStream, Session, SessionConfig, Upstream};
use dialback_transport::{Message, Transport};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// No background pings, so the remote end sees only what the test causes
pub fn quiet_config() -> SessionConfig {
    SessionConfig::default().with_ping_interval(None)
}

pub struct RawPeer {
    transport: Transport,
}

impl RawPeer {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub async fn send(&mut self, frame: Frame) {
        self.transport
            .sink
            .send(Message::Binary(frame.encode().unwrap()))
            .await
            .unwrap();
    }

    pub async fn send_message(&mut self, message: Message) {
        self.transport.sink.send(message).await.unwrap();
    }

    pub async fn next_message(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.transport.source.next_message())
            .await
            .expect("no message from session")
            .unwrap()
            .expect("transport closed")
    }

    pub async fn next_frame(&mut self) -> Frame {
        match self.next_message().await {
            Message::Binary(data) => Frame::decode(data).unwrap(),
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    pub async fn expect(&mut self, connection_id: u64, kind: FrameKind) -> Frame {
        let frame = self.next_frame().await;
        assert_eq!((frame.connection_id, frame.kind), (connection_id, kind), "{:?}", frame);
        frame
    }

    pub async fn close(&mut self) {
        self.transport.sink.close().await.unwrap();
    }
}

/// Dial from `session` and accept the Connect on the raw end
pub async fn establish(session: &Session, peer: &mut RawPeer, address: &str) -> MuxStream {
    let dial = {
        let session = session.clone();
        let address = address.to_string();
        tokio::spawn(async move { session.dial("tcp", &address).await })
    };

    let connect = peer.next_frame().await;
    assert_eq!(connect.kind, FrameKind::Connect);
    let request = ConnectRequest::decode(&connect.payload).unwrap();
    assert_eq!(request.address, address);

    peer.send(Frame::connected(connect.connection_id)).await;
    dial.await.unwrap().unwrap()
}

pub fn payload(bytes: &'static [u8]) -> Bytes {
    Bytes::from_static(bytes)
}

/// Answers every Connect with an in-process echo server
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl ConnectHandler for EchoHandler {
    async fn connect(&self, _request: &ConnectRequest) -> Result<Upstream, DialError> {
        let (near, far) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(near))
    }
}

/// Refuses every Connect
#[derive(Debug, Default)]
pub struct RefusingHandler;

#[async_trait]
impl ConnectHandler for RefusingHandler {
    async fn connect(&self, request: &ConnectRequest) -> Result<Upstream, DialError> {
        Err(DialError::DialFailed(format!("{} refused", request.address)))
    }
}
