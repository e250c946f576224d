//! Liveness enforcement around one physical transport
//!
//! Every read is bounded by `ping_wait`: any message re-arms it, so only
//! forward progress keeps the transport alive. Pings are answered here and
//! pongs are consumed here; neither ever reaches the demultiplexer.

use bytes::Bytes;
use dialback_transport::{Message, MessageSink, MessageSource};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::HeartbeatError;
use crate::metrics::MetricsSink;

pub struct HeartbeatConn {
    connection_id: String,
    sink: AsyncMutex<Box<dyn MessageSink>>,
    source: AsyncMutex<Box<dyn MessageSource>>,
    ping_wait: Duration,
    /// Armed by every ping or pong; writes that outlive it are fatal
    write_deadline: Mutex<Option<Instant>>,
    /// Time spent waiting for messages since the last pong, ping or error
    stalled: Mutex<Duration>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for HeartbeatConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatConn")
            .field("connection_id", &self.connection_id)
            .field("ping_wait", &self.ping_wait)
            .finish()
    }
}

impl HeartbeatConn {
    pub fn new(
        connection_id: impl Into<String>,
        sink: Box<dyn MessageSink>,
        source: Box<dyn MessageSource>,
        ping_wait: Duration,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            sink: AsyncMutex::new(sink),
            source: AsyncMutex::new(source),
            ping_wait,
            write_deadline: Mutex::new(None),
            stalled: Mutex::new(Duration::ZERO),
            metrics,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn ping_wait(&self) -> Duration {
        self.ping_wait
    }

    /// Time spent waiting on the transport since the last liveness reset
    pub fn stalled_for(&self) -> Duration {
        *self.stalled.lock()
    }

    /// Write one message
    ///
    /// Without a deadline the caller waits for the transport. With one, the
    /// write runs on its own task and the caller gives up at the deadline
    /// with [`HeartbeatError::WriteTimeout`]; the abandoned write is neither
    /// cancelled nor retried and may still reach the peer.
    pub async fn write_message(
        self: &Arc<Self>,
        message: Message,
        deadline: Option<Instant>,
    ) -> Result<(), HeartbeatError> {
        let Some(deadline) = deadline else {
            return self.write_locked(message).await;
        };

        let (tx, rx) = oneshot::channel();
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let _ = tx.send(conn.write_locked(message).await);
        });

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HeartbeatError::Closed),
            Err(_) => Err(HeartbeatError::WriteTimeout),
        }
    }

    async fn write_locked(&self, message: Message) -> Result<(), HeartbeatError> {
        let deadline = *self.write_deadline.lock();
        let mut sink = self.sink.lock().await;
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, sink.send(message))
                .await
                .map_err(|_| HeartbeatError::Timeout(self.ping_wait))??,
            None => sink.send(message).await?,
        }
        Ok(())
    }

    /// Send a liveness probe
    pub async fn send_ping(&self) -> Result<(), HeartbeatError> {
        self.send_control(Message::Ping(Bytes::new())).await
    }

    async fn send_control(&self, message: Message) -> Result<(), HeartbeatError> {
        tokio::time::timeout(self.ping_wait, self.write_locked(message))
            .await
            .map_err(|_| HeartbeatError::Timeout(self.ping_wait))?
    }

    /// Read the next application message
    ///
    /// Fails with [`HeartbeatError::Timeout`] when nothing at all arrives
    /// within `ping_wait`, and with [`HeartbeatError::Closed`] once the peer
    /// closed the transport.
    pub async fn next_message(&self) -> Result<Bytes, HeartbeatError> {
        let mut source = self.source.lock().await;

        loop {
            let started = Instant::now();
            let next = tokio::time::timeout(self.ping_wait, source.next_message()).await;
            *self.stalled.lock() += started.elapsed();

            let message = match next {
                Ok(Ok(Some(message))) => message,
                Ok(Ok(None)) => {
                    self.observe_stall();
                    return Err(HeartbeatError::Closed);
                }
                Ok(Err(e)) => {
                    self.observe_stall();
                    return Err(e.into());
                }
                Err(_) => {
                    self.observe_stall();
                    debug!(
                        connection_id = %self.connection_id,
                        "No liveness event within {:?}", self.ping_wait
                    );
                    return Err(HeartbeatError::Timeout(self.ping_wait));
                }
            };

            self.metrics.transport_message(message.kind());

            match message {
                Message::Binary(data) => return Ok(data),
                Message::Ping(payload) => {
                    trace!(connection_id = %self.connection_id, "ping received");
                    *self.stalled.lock() = Duration::ZERO;
                    self.send_control(Message::Pong(payload)).await?;
                    self.extend_write_deadline();
                }
                Message::Pong(_) => {
                    trace!(connection_id = %self.connection_id, "pong received");
                    self.observe_stall();
                    self.extend_write_deadline();
                }
                Message::Close => {
                    self.observe_stall();
                    return Err(HeartbeatError::Closed);
                }
            }
        }
    }

    /// Close the write half; bounded by `ping_wait`
    pub async fn close(&self) -> Result<(), HeartbeatError> {
        let close = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };
        tokio::time::timeout(self.ping_wait, close)
            .await
            .map_err(|_| HeartbeatError::Timeout(self.ping_wait))??;
        Ok(())
    }

    fn extend_write_deadline(&self) {
        *self.write_deadline.lock() = Some(Instant::now() + self.ping_wait);
    }

    fn observe_stall(&self) {
        let stalled = std::mem::take(&mut *self.stalled.lock());
        self.metrics.liveness_elapsed(stalled.as_secs_f64());
    }
}
