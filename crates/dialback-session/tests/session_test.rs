//! Session behavior as seen from the remote end of the transport

mod common;

use common::{establish, init_tracing, payload, quiet_config, EchoHandler, RawPeer, RefusingHandler};
use dialback_proto::{ConnectRequest, Frame, FrameError, FrameKind};
use dialback_session::{ConnState, DialError, Role, Session, SessionError};
use dialback_transport::{memory, Message};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn start(config: dialback_session::SessionConfig) -> (Session, RawPeer) {
    let (local, remote) = memory::pair();
    let session = Session::builder("agent-1")
        .role(Role::Server)
        .config(config)
        .start(local);
    (session, RawPeer::new(remote))
}

#[tokio::test]
async fn test_dial_exchange_and_remote_close() {
    init_tracing();
    let (session, mut peer) = start(quiet_config());

    let dial = {
        let session = session.clone();
        tokio::spawn(async move { session.dial("tcp", "10.0.0.5:80").await })
    };

    let connect = peer.expect(1, FrameKind::Connect).await;
    let request = ConnectRequest::decode(&connect.payload).unwrap();
    assert_eq!(request.proto, "tcp");
    assert_eq!(request.address, "10.0.0.5:80");

    peer.send(Frame::connected(1)).await;
    let mut stream = dial.await.unwrap().unwrap();
    assert_eq!(stream.id(), 1);
    assert_eq!(stream.state(), ConnState::Established);

    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let data = peer.expect(1, FrameKind::Data).await;
    assert_eq!(data.payload, payload(b"GET / HTTP/1.0\r\n\r\n"));

    peer.send(Frame::data(1, payload(b"HTTP/1.0 200 OK\r\n\r\n"))).await;
    peer.send(Frame::close(1)).await;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"HTTP/1.0 200 OK\r\n\r\n");

    // Our direction is still open after the remote's Close
    assert_eq!(stream.state(), ConnState::HalfClosed);
    stream.write_all(b"late").await.unwrap();
    peer.expect(1, FrameKind::Data).await;

    stream.shutdown().await.unwrap();
    peer.expect(1, FrameKind::Close).await;
    assert_eq!(stream.state(), ConnState::Closed);
    assert_eq!(session.connection_count(), 0);
}

#[tokio::test]
async fn test_dropping_stream_sends_close_once() {
    let (session, mut peer) = start(quiet_config());
    let stream = establish(&session, &mut peer, "10.0.0.5:80").await;
    assert_eq!(session.connection_ids(), vec![1]);

    drop(stream);
    assert_eq!(session.connection_count(), 0);
    peer.expect(1, FrameKind::Close).await;

    // A late Close for the released id is ignored
    peer.send(Frame::close(1)).await;
    let next = establish(&session, &mut peer, "10.0.0.5:81").await;
    assert_eq!(next.id(), 3);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_ids_are_never_reused() {
    let (session, mut peer) = start(quiet_config());

    let mut ids = Vec::new();
    for port in 0..3 {
        let stream = establish(&session, &mut peer, &format!("10.0.0.5:{}", 8000 + port)).await;
        ids.push(stream.id());
        drop(stream);
        peer.next_frame().await;
    }
    assert_eq!(ids, vec![1, 3, 5]);
}

#[tokio::test]
async fn test_ping_is_answered_without_disturbing_connections() {
    let (session, mut peer) = start(quiet_config());

    let mut streams = Vec::new();
    for port in 0..3 {
        streams.push(establish(&session, &mut peer, &format!("10.0.0.5:{}", 9000 + port)).await);
    }

    peer.send_message(Message::Ping(payload(b"hb"))).await;
    assert_eq!(peer.next_message().await, Message::Pong(payload(b"hb")));
    assert!(session.liveness_stall() < Duration::from_secs(1));

    assert_eq!(session.connection_count(), 3);
    for stream in &mut streams {
        assert_eq!(stream.state(), ConnState::Established);
        stream.write_all(b"x").await.unwrap();
        peer.expect(stream.id(), FrameKind::Data).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_silence_past_ping_wait_fails_every_connection_once() {
    let config = quiet_config().with_ping_wait(Duration::from_secs(10));
    let (session, mut peer) = start(config);

    let mut first = establish(&session, &mut peer, "10.0.0.5:80").await;
    let mut second = establish(&session, &mut peer, "10.0.0.5:81").await;

    session.closed().await;
    assert!(matches!(session.close_reason(), Some(SessionError::Heartbeat(_))));
    assert_eq!(session.connection_count(), 0);

    let mut buf = [0u8; 16];
    for stream in [&mut first, &mut second] {
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionAborted);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(stream.write_all(b"x").await.is_err());
    }
}

#[tokio::test]
async fn test_transport_close_ends_session() {
    let (session, mut peer) = start(quiet_config());
    let mut stream = establish(&session, &mut peer, "10.0.0.5:80").await;

    peer.close().await;
    session.closed().await;
    assert_eq!(session.close_reason(), Some(SessionError::TransportClosed));

    let mut buf = [0u8; 16];
    assert!(stream.read(&mut buf).await.is_err());
    assert_eq!(
        session.dial("tcp", "10.0.0.5:80").await.unwrap_err(),
        DialError::SessionClosed
    );
}

#[tokio::test]
async fn test_undecodable_frame_ends_session() {
    let (session, mut peer) = start(quiet_config());

    peer.send_message(Message::Binary(payload(&[0, 0, 1]))).await;
    session.closed().await;

    assert_eq!(
        session.close_reason(),
        Some(SessionError::Decode(FrameError::Truncated { len: 3 }))
    );
}

#[tokio::test]
async fn test_unknown_ids_are_ignored() {
    let (session, mut peer) = start(quiet_config());

    peer.send(Frame::data(99, payload(b"stray"))).await;
    peer.send(Frame::close(77)).await;
    peer.send(Frame::pause(55)).await;
    peer.send(Frame::connected(33)).await;
    peer.send(Frame::error(11, "gone")).await;

    let mut stream = establish(&session, &mut peer, "10.0.0.5:80").await;
    assert!(!session.is_closed());
    assert_eq!(session.connection_count(), 1);

    stream.write_all(b"ok").await.unwrap();
    peer.expect(1, FrameKind::Data).await;
}

#[tokio::test]
async fn test_writes_keep_per_connection_order() {
    let (session, mut peer) = start(quiet_config().with_max_frame_payload(4));
    let mut a = establish(&session, &mut peer, "10.0.0.5:80").await;
    let mut b = establish(&session, &mut peer, "10.0.0.5:81").await;

    a.write_all(b"abcdefghij").await.unwrap();
    b.write_all(b"xy").await.unwrap();

    let mut chunks = Vec::new();
    for _ in 0..4 {
        let frame = peer.next_frame().await;
        assert_eq!(frame.kind, FrameKind::Data);
        chunks.push((frame.connection_id, frame.payload));
    }
    assert_eq!(
        chunks,
        vec![
            (1, payload(b"abcd")),
            (1, payload(b"efgh")),
            (1, payload(b"ij")),
            (3, payload(b"xy")),
        ]
    );

    // Data for one id never shows up on another
    peer.send(Frame::data(3, payload(b"for-b"))).await;
    peer.send(Frame::data(1, payload(b"for-a"))).await;
    let mut buf = [0u8; 5];
    b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"for-b");
    a.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"for-a");
}

#[tokio::test]
async fn test_full_buffer_pauses_only_that_connection() {
    let (session, mut peer) = start(quiet_config().with_max_buffer(16));
    let mut a = establish(&session, &mut peer, "10.0.0.5:80").await;
    let mut b = establish(&session, &mut peer, "10.0.0.5:81").await;

    peer.send(Frame::data(1, payload(&[7u8; 32]))).await;
    peer.expect(1, FrameKind::Pause).await;

    peer.send(Frame::data(3, payload(b"hi"))).await;
    let mut buf = [0u8; 2];
    b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");

    let mut drained = [0u8; 64];
    let n = a.read(&mut drained).await.unwrap();
    assert_eq!(n, 32);
    peer.expect(1, FrameKind::Resume).await;
}

#[tokio::test]
async fn test_pause_after_drain_follows_resume_on_the_wire() {
    let (session, mut peer) = start(quiet_config().with_max_buffer(16));
    let mut a = establish(&session, &mut peer, "10.0.0.5:80").await;

    peer.send(Frame::data(1, payload(&[1u8; 32]))).await;
    peer.expect(1, FrameKind::Pause).await;

    // The drain happens before the session reads the second frame, so the
    // buffer empties (Resume) and then refills past the mark (Pause)
    peer.send(Frame::data(1, payload(&[2u8; 32]))).await;
    let mut first = [0u8; 32];
    a.read_exact(&mut first).await.unwrap();
    assert_eq!(first, [1u8; 32]);

    peer.expect(1, FrameKind::Resume).await;
    peer.expect(1, FrameKind::Pause).await;

    let mut second = [0u8; 32];
    a.read_exact(&mut second).await.unwrap();
    assert_eq!(second, [2u8; 32]);
    peer.expect(1, FrameKind::Resume).await;
}

#[tokio::test]
async fn test_remote_pause_blocks_only_that_writer() {
    let (session, mut peer) = start(quiet_config());
    let mut a = establish(&session, &mut peer, "10.0.0.5:80").await;
    let b = establish(&session, &mut peer, "10.0.0.5:81").await;

    peer.send(Frame::pause(3)).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !b.is_paused() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let writer = tokio::spawn(async move {
        let mut b = b;
        b.write_all(b"later").await.unwrap();
        b
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());

    a.write_all(b"still flowing").await.unwrap();
    let frame = peer.expect(1, FrameKind::Data).await;
    assert_eq!(frame.payload, payload(b"still flowing"));

    peer.send(Frame::resume(3)).await;
    let _b = writer.await.unwrap();
    let frame = peer.expect(3, FrameKind::Data).await;
    assert_eq!(frame.payload, payload(b"later"));
}

#[tokio::test]
async fn test_refused_dial_fails_without_reply() {
    let (session, mut peer) = start(quiet_config());

    let dial = {
        let session = session.clone();
        tokio::spawn(async move { session.dial("tcp", "10.0.0.5:80").await })
    };
    peer.expect(1, FrameKind::Connect).await;
    peer.send(Frame::error(1, "connection refused")).await;

    assert_eq!(
        dial.await.unwrap().unwrap_err(),
        DialError::DialFailed("connection refused".to_string())
    );
    assert_eq!(session.connection_count(), 0);
}

#[tokio::test]
async fn test_dial_timeout_releases_id() {
    let (session, mut peer) = start(quiet_config().with_dial_timeout(Duration::from_millis(100)));

    let dial = {
        let session = session.clone();
        tokio::spawn(async move { session.dial("tcp", "10.0.0.5:80").await })
    };
    peer.expect(1, FrameKind::Connect).await;

    assert_eq!(
        dial.await.unwrap().unwrap_err(),
        DialError::Timeout(Duration::from_millis(100))
    );
    peer.expect(1, FrameKind::Error).await;
    assert_eq!(session.connection_count(), 0);

    // An acceptance arriving after the timeout is ignored
    peer.send(Frame::connected(1)).await;
    let stream = establish(&session, &mut peer, "10.0.0.5:80").await;
    assert_eq!(stream.id(), 3);
}

#[tokio::test]
async fn test_cancelled_dial_aborts_remote() {
    let (session, mut peer) = start(quiet_config());

    let dial = {
        let session = session.clone();
        tokio::spawn(async move { session.dial("tcp", "10.0.0.5:80").await })
    };
    peer.expect(1, FrameKind::Connect).await;
    dial.abort();
    assert!(dial.await.unwrap_err().is_cancelled());

    let frame = peer.expect(1, FrameKind::Error).await;
    assert_eq!(frame.text(), "dial abandoned");
    assert_eq!(session.connection_count(), 0);
}

#[tokio::test]
async fn test_connect_without_handler_is_refused() {
    let (session, mut peer) = start(quiet_config());

    let request = ConnectRequest::new("tcp", "127.0.0.1:22", Duration::from_secs(5));
    peer.send(Frame::connect(2, &request)).await;

    peer.expect(2, FrameKind::Error).await;
    assert_eq!(session.connection_count(), 0);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_inbound_connect_is_bridged_to_handler() {
    let (local, remote) = memory::pair();
    let session = Session::builder("server")
        .role(Role::Client)
        .config(quiet_config())
        .connect_handler(Arc::new(EchoHandler))
        .start(local);
    let mut peer = RawPeer::new(remote);

    let request = ConnectRequest::new("tcp", "echo:7", Duration::from_secs(5));
    peer.send(Frame::connect(1, &request)).await;
    peer.expect(1, FrameKind::Connected).await;
    assert_eq!(session.connection_count(), 1);

    peer.send(Frame::data(1, payload(b"ping"))).await;
    let echoed = peer.expect(1, FrameKind::Data).await;
    assert_eq!(echoed.payload, payload(b"ping"));

    // Our Close ends the echo, which closes its side in turn
    peer.send(Frame::close(1)).await;
    peer.expect(1, FrameKind::Close).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.connection_count(), 0);
}

#[tokio::test]
async fn test_handler_refusal_is_reported() {
    let (local, remote) = memory::pair();
    let _session = Session::builder("server")
        .role(Role::Client)
        .config(quiet_config())
        .connect_handler(Arc::new(RefusingHandler))
        .start(local);
    let mut peer = RawPeer::new(remote);

    let request = ConnectRequest::new("tcp", "127.0.0.1:22", Duration::from_secs(5));
    peer.send(Frame::connect(1, &request)).await;

    let frame = peer.expect(1, FrameKind::Error).await;
    assert!(frame.text().contains("127.0.0.1:22 refused"));
}

#[tokio::test]
async fn test_both_ends_dial_over_one_session() {
    let (a, b) = memory::pair();
    let server = Session::builder("agent-1")
        .role(Role::Server)
        .config(quiet_config())
        .connect_handler(Arc::new(EchoHandler))
        .start(a);
    let client = Session::builder("server")
        .role(Role::Client)
        .config(quiet_config())
        .connect_handler(Arc::new(EchoHandler))
        .start(b);

    let mut from_server = server.dial("tcp", "echo:7").await.unwrap();
    let mut from_client = client.dial("tcp", "echo:7").await.unwrap();
    assert_eq!(from_server.id() % 2, 1);
    assert_eq!(from_client.id() % 2, 0);

    from_server.write_all(b"one").await.unwrap();
    from_client.write_all(b"two").await.unwrap();

    let mut buf = [0u8; 3];
    from_server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"one");
    from_client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"two");
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|n| (n % 251) as u8 ^ seed).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bulk_streams_stay_separate() {
    const LEN: usize = 3 * 1024 * 1024;

    let config = quiet_config()
        .with_max_frame_payload(1024)
        .with_max_buffer(8 * 1024);
    let (a, b) = memory::pair();
    let server = Session::builder("agent-1")
        .role(Role::Server)
        .config(config.clone())
        .start(a);
    let _client = Session::builder("server")
        .role(Role::Client)
        .config(config)
        .connect_handler(Arc::new(EchoHandler))
        .start(b);

    let mut tasks = Vec::new();
    for seed in [0x00u8, 0xa5] {
        let stream = server.dial("tcp", "echo:7").await.unwrap();
        tasks.push(tokio::spawn(async move {
            let expected = pattern(seed, LEN);
            let (mut reader, mut writer) = tokio::io::split(stream);

            let sent = expected.clone();
            let write = tokio::spawn(async move {
                writer.write_all(&sent).await.unwrap();
                writer.shutdown().await.unwrap();
            });

            let mut echoed = Vec::with_capacity(LEN);
            reader.read_to_end(&mut echoed).await.unwrap();
            write.await.unwrap();
            (seed, echoed == expected, echoed.len())
        }));
    }

    for task in tasks {
        let (seed, intact, len) = tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .expect("bulk transfer stalled")
            .unwrap();
        assert_eq!(len, LEN, "stream {:#x} length", seed);
        assert!(intact, "stream {:#x} saw foreign or reordered bytes", seed);
    }
    assert!(!server.is_closed());
}
