//! In-process transport pair
//!
//! Two [`Transport`]s wired back to back through bounded channels. Used by
//! tests to stand in for a WebSocket, and by embedders that run both ends of
//! a session in one process.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{Message, MessageSink, MessageSource, Transport, TransportError, TransportResult};

const DEFAULT_CAPACITY: usize = 1024;

/// Create a connected pair with the default per-direction capacity
pub fn pair() -> (Transport, Transport) {
    pair_with_capacity(DEFAULT_CAPACITY)
}

/// Create a connected pair where each direction buffers at most `capacity`
/// messages; sends block once the buffer is full and the other end is not
/// reading.
pub fn pair_with_capacity(capacity: usize) -> (Transport, Transport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    let a = Transport::new(MemorySink::new(a_tx), MemorySource::new(a_rx))
        .with_connection_id(format!("mem-{}", uuid::Uuid::new_v4()));
    let b = Transport::new(MemorySink::new(b_tx), MemorySource::new(b_rx))
        .with_connection_id(format!("mem-{}", uuid::Uuid::new_v4()));

    (a, b)
}

#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::Sender<Message>>,
}

impl MemorySink {
    fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx: Some(tx) }
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, message: Message) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        trace!(kind = message.kind(), "memory transport send");
        tx.send(message).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> TransportResult<()> {
        if let Some(tx) = self.tx.take() {
            // Never block on a full buffer while closing
            let _ = tx.try_send(Message::Close);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<Message>,
}

impl MemorySource {
    fn new(rx: mpsc::Receiver<Message>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next_message(&mut self) -> TransportResult<Option<Message>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (mut a, mut b) = pair();

        for i in 0..10u8 {
            a.sink.send(Message::Binary(Bytes::from(vec![i]))).await.unwrap();
        }

        for i in 0..10u8 {
            let msg = b.source.next_message().await.unwrap();
            assert_eq!(msg, Some(Message::Binary(Bytes::from(vec![i]))));
        }
    }

    #[tokio::test]
    async fn test_close_is_observed() {
        let (mut a, mut b) = pair();

        a.sink.close().await.unwrap();
        assert_eq!(b.source.next_message().await.unwrap(), Some(Message::Close));
        assert_eq!(b.source.next_message().await.unwrap(), None);

        assert!(matches!(
            a.sink.send(Message::Ping(Bytes::new())).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_peer_fails_send() {
        let (mut a, b) = pair();
        drop(b);

        assert!(a.sink.send(Message::Binary(Bytes::new())).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_blocks_sender() {
        let (mut a, _b) = pair_with_capacity(1);

        a.sink.send(Message::Binary(Bytes::new())).await.unwrap();
        let blocked = tokio::time::timeout(
            Duration::from_secs(1),
            a.sink.send(Message::Binary(Bytes::new())),
        )
        .await;
        assert!(blocked.is_err(), "second send should wait for the reader");
    }
}
