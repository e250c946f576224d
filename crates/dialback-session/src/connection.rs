//! Logical connections and the byte-stream handle over them

use bytes::{Buf, Bytes};
use dialback_proto::{ConnectRequest, Frame};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::error::DialError;
use crate::session::Session;

/// Lifecycle of one logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Connect sent, waiting for the remote side to accept
    Connecting,
    /// Both directions open
    Established,
    /// Exactly one direction has sent Close
    HalfClosed,
    /// Both directions done, or aborted by an error
    Closed,
}

/// Why a connection was torn down without a clean close
#[derive(Debug, Clone)]
pub(crate) enum Failure {
    /// The remote side sent an Error frame
    Remote(String),
    /// The owning session died
    Session(String),
    /// Cancelled locally before the remote accepted
    Aborted(String),
}

impl Failure {
    fn io_error(&self) -> io::Error {
        match self {
            Failure::Remote(reason) => io::Error::new(io::ErrorKind::ConnectionReset, reason.clone()),
            Failure::Session(reason) => io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("session closed: {}", reason),
            ),
            Failure::Aborted(reason) => {
                io::Error::new(io::ErrorKind::ConnectionAborted, reason.clone())
            }
        }
    }

    fn dial_error(&self) -> DialError {
        match self {
            Failure::Remote(reason) | Failure::Aborted(reason) => {
                DialError::DialFailed(reason.clone())
            }
            Failure::Session(_) => DialError::SessionClosed,
        }
    }
}

/// Outcome of buffering an inbound Data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Push {
    Buffered,
    /// Buffered, and the buffer just crossed the high-water mark
    Pause,
    /// The connection no longer accepts data
    Dropped,
}

type EstablishedTx = oneshot::Sender<Result<(), DialError>>;
pub(crate) type EstablishedRx = oneshot::Receiver<Result<(), DialError>>;

struct ConnInner {
    state: ConnState,
    buffer: VecDeque<Bytes>,
    buffered: usize,
    /// We asked the remote to stop sending
    pause_sent: bool,
    local_closed: bool,
    remote_closed: bool,
    failure: Option<Failure>,
    failure_reported: bool,
    read_waker: Option<Waker>,
    last_activity: Instant,
}

impl ConnInner {
    fn new(state: ConnState) -> Self {
        Self {
            state,
            buffer: VecDeque::new(),
            buffered: 0,
            pause_sent: false,
            local_closed: false,
            remote_closed: false,
            failure: None,
            failure_reported: false,
            read_waker: None,
            last_activity: Instant::now(),
        }
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

/// State of one multiplexed stream, owned by its session's table
pub(crate) struct LogicalConn {
    id: u64,
    request: ConnectRequest,
    inner: Mutex<ConnInner>,
    /// Set while the remote side has paused us
    remote_paused: watch::Sender<bool>,
    established: Mutex<Option<EstablishedTx>>,
}

impl std::fmt::Debug for LogicalConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalConn")
            .field("id", &self.id)
            .field("target", &self.request.to_string())
            .field("state", &self.state())
            .finish()
    }
}

impl LogicalConn {
    fn with_state(id: u64, request: ConnectRequest, state: ConnState) -> Self {
        let (remote_paused, _) = watch::channel(false);
        Self {
            id,
            request,
            inner: Mutex::new(ConnInner::new(state)),
            remote_paused,
            established: Mutex::new(None),
        }
    }

    /// An outbound connection waiting for the remote side to accept
    pub(crate) fn connecting(id: u64, request: ConnectRequest) -> (Arc<Self>, EstablishedRx) {
        let (tx, rx) = oneshot::channel();
        let conn = Self::with_state(id, request, ConnState::Connecting);
        *conn.established.lock() = Some(tx);
        (Arc::new(conn), rx)
    }

    /// An inbound connection whose target was already reached
    pub(crate) fn established(id: u64, request: ConnectRequest) -> Arc<Self> {
        Arc::new(Self::with_state(id, request, ConnState::Established))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn request(&self) -> &ConnectRequest {
        &self.request
    }

    pub(crate) fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    pub(crate) fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    /// Connecting -> Established; false if the connection already moved on
    pub(crate) fn mark_established(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnState::Connecting {
                return false;
            }
            inner.state = ConnState::Established;
            inner.last_activity = Instant::now();
        }
        if let Some(tx) = self.established.lock().take() {
            let _ = tx.send(Ok(()));
        }
        true
    }

    /// Buffer inbound data. `send_pause` runs under the connection lock when
    /// the buffer crosses `max_buffer`, so it must not block.
    pub(crate) fn push_data(
        &self,
        data: Bytes,
        max_buffer: usize,
        send_pause: impl FnOnce(),
    ) -> Push {
        let mut inner = self.inner.lock();
        if inner.remote_closed || inner.state == ConnState::Closed {
            return Push::Dropped;
        }
        if data.is_empty() {
            return Push::Buffered;
        }

        inner.buffered += data.len();
        inner.buffer.push_back(data);
        inner.last_activity = Instant::now();
        inner.wake_reader();

        if inner.buffered > max_buffer && !inner.pause_sent {
            inner.pause_sent = true;
            send_pause();
            return Push::Pause;
        }
        Push::Buffered
    }

    /// The remote side sent Close; true once both directions are closed
    pub(crate) fn remote_close(&self) -> bool {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            ConnState::Closed => false,
            ConnState::Connecting => {
                drop(inner);
                self.fail(Failure::Remote("closed before the connection was accepted".to_string()))
            }
            ConnState::Established | ConnState::HalfClosed => {
                inner.remote_closed = true;
                inner.state = if inner.local_closed {
                    ConnState::Closed
                } else {
                    ConnState::HalfClosed
                };
                inner.last_activity = Instant::now();
                inner.wake_reader();
                inner.state == ConnState::Closed
            }
        }
    }

    /// Our write half is done. Returns `Some(fully_closed)` when a Close
    /// frame must be sent, `None` when there is nothing left to close.
    pub(crate) fn local_close(&self) -> Option<bool> {
        let mut inner = self.inner.lock();
        if inner.local_closed || inner.state == ConnState::Closed {
            return None;
        }
        inner.local_closed = true;
        inner.state = if inner.remote_closed {
            ConnState::Closed
        } else {
            ConnState::HalfClosed
        };
        Some(inner.state == ConnState::Closed)
    }

    /// Full close from the local side; true when a Close frame is still
    /// owed to the remote
    pub(crate) fn abandon(&self) -> bool {
        let owe_close = {
            let mut inner = self.inner.lock();
            let owe_close = !inner.local_closed && inner.state != ConnState::Closed;
            inner.local_closed = true;
            inner.state = ConnState::Closed;
            inner.buffer.clear();
            inner.buffered = 0;
            owe_close
        };
        self.remote_paused.send_replace(false);
        owe_close
    }

    /// Abort both directions; false if the connection was already closed
    pub(crate) fn fail(&self, failure: Failure) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnState::Closed {
                return false;
            }
            inner.state = ConnState::Closed;
            inner.failure = Some(failure.clone());
            inner.buffer.clear();
            inner.buffered = 0;
            inner.wake_reader();
        }
        if let Some(tx) = self.established.lock().take() {
            let _ = tx.send(Err(failure.dial_error()));
        }
        // Wake writers parked on a pause so they observe the failure
        self.remote_paused.send_replace(false);
        true
    }

    pub(crate) fn set_remote_paused(&self, paused: bool) {
        self.remote_paused.send_replace(paused);
    }

    pub(crate) fn is_remote_paused(&self) -> bool {
        *self.remote_paused.borrow()
    }

    fn write_error(&self) -> Option<io::Error> {
        let inner = self.inner.lock();
        if let Some(failure) = &inner.failure {
            return Some(failure.io_error());
        }
        if inner.local_closed || inner.state == ConnState::Closed {
            return Some(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed for writing",
            ));
        }
        None
    }

    /// Wait until the remote side is not pausing us
    pub(crate) async fn wait_writable(&self) -> io::Result<()> {
        let mut paused = self.remote_paused.subscribe();
        loop {
            if let Some(err) = self.write_error() {
                return Err(err);
            }
            if !*paused.borrow_and_update() {
                return Ok(());
            }
            if paused.changed().await.is_err() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection dropped"));
            }
        }
    }

    /// Copy buffered bytes into `buf`. Resolves to true when the drain let
    /// the buffer fall to `resume_threshold` after a Pause; `send_resume`
    /// then runs under the connection lock, ordered against `push_data`.
    pub(crate) fn poll_read(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
        resume_threshold: usize,
        send_resume: impl FnOnce(),
    ) -> Poll<io::Result<bool>> {
        let mut inner = self.inner.lock();

        if !inner.buffer.is_empty() {
            while buf.remaining() > 0 {
                let Some(chunk) = inner.buffer.front_mut() else {
                    break;
                };
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                chunk.advance(n);
                if chunk.is_empty() {
                    inner.buffer.pop_front();
                }
                inner.buffered -= n;
            }

            let resume = inner.pause_sent && inner.buffered <= resume_threshold;
            if resume {
                inner.pause_sent = false;
                send_resume();
            }
            return Poll::Ready(Ok(resume));
        }

        if let Some(failure) = &inner.failure {
            if !inner.failure_reported {
                let err = failure.io_error();
                inner.failure_reported = true;
                return Poll::Ready(Err(err));
            }
            return Poll::Ready(Ok(false));
        }

        if inner.remote_closed || inner.state == ConnState::Closed {
            return Poll::Ready(Ok(false));
        }

        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Byte-stream handle for one logical connection
///
/// Reads drain the connection's inbound buffer and end once the remote side
/// sent Close. Writes become Data frames, split at the session's maximum
/// frame payload. `shutdown` sends Close for our direction only; dropping
/// the handle closes both.
pub struct MuxStream {
    session: Session,
    conn: Arc<LogicalConn>,
    write_timeout: Option<Duration>,
    pending_write: Option<BoxFuture<'static, io::Result<usize>>>,
    pending_shutdown: Option<BoxFuture<'static, io::Result<()>>>,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("session", &self.session.id())
            .field("conn", &self.conn)
            .finish()
    }
}

impl MuxStream {
    pub(crate) fn new(session: Session, conn: Arc<LogicalConn>) -> Self {
        let write_timeout = session.config().write_timeout;
        Self {
            session,
            conn,
            write_timeout,
            pending_write: None,
            pending_shutdown: None,
        }
    }

    /// Connection id, unique within the session
    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    pub fn proto(&self) -> &str {
        &self.conn.request().proto
    }

    pub fn address(&self) -> &str {
        &self.conn.request().address
    }

    pub fn state(&self) -> ConnState {
        self.conn.state()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Last time data moved in either direction
    pub fn last_activity(&self) -> Instant {
        self.conn.last_activity()
    }

    /// Whether the remote side currently has us paused
    pub fn is_paused(&self) -> bool {
        self.conn.is_remote_paused()
    }

    /// Deadline for each subsequent write (None = wait for the transport)
    pub fn set_write_timeout(&mut self, write_timeout: Option<Duration>) {
        self.write_timeout = write_timeout;
    }

    /// Close both directions now
    pub fn close(self) {
        drop(self);
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let threshold = self.session.config().resume_threshold();
        let id = self.conn.id();
        let session = &self.session;
        ready!(self
            .conn
            .poll_read(cx, buf, threshold, || session.queue_frame(Frame::resume(id))))?;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let mut write = match this.pending_write.take() {
            Some(write) => write,
            None => {
                if buf.is_empty() {
                    return Poll::Ready(Ok(0));
                }
                let n = buf.len().min(this.session.config().max_frame_payload);
                let data = Bytes::copy_from_slice(&buf[..n]);
                let session = this.session.clone();
                let conn = this.conn.clone();
                let write_timeout = this.write_timeout;
                Box::pin(async move {
                    session.write_data(&conn, data, write_timeout).await?;
                    Ok(n)
                })
            }
        };

        match write.as_mut().poll(cx) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => {
                this.pending_write = Some(write);
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(write) = this.pending_write.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(write.as_mut().poll(cx));
        this.pending_write = None;
        Poll::Ready(result.map(|_| ()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        let this = self.get_mut();

        let mut shutdown = match this.pending_shutdown.take() {
            Some(shutdown) => shutdown,
            None => {
                let session = this.session.clone();
                let conn = this.conn.clone();
                Box::pin(async move { session.shutdown_write(&conn).await })
            }
        };

        match shutdown.as_mut().poll(cx) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => {
                this.pending_shutdown = Some(shutdown);
                Poll::Pending
            }
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.session.release(&self.conn);
    }
}
