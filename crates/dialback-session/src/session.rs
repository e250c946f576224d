//! One physical transport and every logical connection multiplexed over it

use bytes::Bytes;
use dialback_proto::{ConnectRequest, Frame, FrameKind};
use dialback_transport::{Message, Transport, TransportError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::connection::{Failure, LogicalConn, MuxStream, Push};
use crate::error::{write_io_error, DialError, HeartbeatError, SessionError};
use crate::handler::{bridge, ConnectHandler};
use crate::heartbeat::HeartbeatConn;
use crate::manager::ClientDirectory;
use crate::metrics::{MetricsSink, NoopMetrics};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Which end of the physical transport this session is
///
/// The two ends allocate connection ids from disjoint sets so that both may
/// dial over the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted the transport; allocates odd ids starting at 1
    Server,
    /// Initiated the transport; allocates even ids starting at 2
    Client,
}

impl Role {
    fn first_id(self) -> u64 {
        match self {
            Role::Server => 1,
            Role::Client => 2,
        }
    }
}

#[derive(Default)]
struct ConnTable {
    closed: bool,
    reason: Option<SessionError>,
    conns: HashMap<u64, Arc<LogicalConn>>,
    /// Inbound Connects whose target dial is still running
    accepting: HashSet<u64>,
}

struct SessionInner {
    id: u64,
    client_key: String,
    role: Role,
    peer: bool,
    remote_addr: Option<SocketAddr>,
    config: SessionConfig,
    conn: Arc<HeartbeatConn>,
    table: Mutex<ConnTable>,
    next_id: AtomicU64,
    control_tx: mpsc::UnboundedSender<Frame>,
    connect_handler: Option<Arc<dyn ConnectHandler>>,
    client_directory: Option<Arc<dyn ClientDirectory>>,
    metrics: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
}

/// Handle to a running session; clones share the same session
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("client_key", &self.inner.client_key)
            .field("role", &self.inner.role)
            .field("peer", &self.inner.peer)
            .finish()
    }
}

pub struct SessionBuilder {
    client_key: String,
    role: Role,
    peer: bool,
    config: SessionConfig,
    metrics: Arc<dyn MetricsSink>,
    connect_handler: Option<Arc<dyn ConnectHandler>>,
    client_directory: Option<Arc<dyn ClientDirectory>>,
}

impl SessionBuilder {
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Mark the session as a link to another server instance
    pub fn peer(mut self, peer: bool) -> Self {
        self.peer = peer;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Accept inbound Connects through this handler; without one they are
    /// refused with an Error frame
    pub fn connect_handler(mut self, handler: Arc<dyn ConnectHandler>) -> Self {
        self.connect_handler = Some(handler);
        self
    }

    /// Forward AddClient/RemoveClient announcements here
    pub fn client_directory(mut self, directory: Arc<dyn ClientDirectory>) -> Self {
        self.client_directory = Some(directory);
        self
    }

    /// Start serving `transport`. Must be called inside a tokio runtime.
    pub fn start(self, transport: Transport) -> Session {
        let Transport {
            connection_id,
            remote_addr,
            sink,
            source,
        } = transport;

        let conn = Arc::new(HeartbeatConn::new(
            connection_id,
            sink,
            source,
            self.config.ping_wait,
            self.metrics.clone(),
        ));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let session = Session {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                client_key: self.client_key,
                role: self.role,
                peer: self.peer,
                remote_addr,
                next_id: AtomicU64::new(self.role.first_id()),
                config: self.config,
                conn,
                table: Mutex::new(ConnTable::default()),
                control_tx,
                connect_handler: self.connect_handler,
                client_directory: self.client_directory,
                metrics: self.metrics,
                shutdown: CancellationToken::new(),
            }),
        };

        info!(
            session_id = session.id(),
            client_key = %session.client_key(),
            transport = %session.inner.conn.connection_id(),
            role = ?session.role(),
            peer = session.is_peer(),
            "Session started"
        );

        tokio::spawn(session.clone().run_reader());
        tokio::spawn(session.clone().run_control(control_rx));
        if let Some(interval) = session.inner.config.ping_interval {
            tokio::spawn(session.clone().run_pinger(interval));
        }

        session
    }
}

impl Session {
    pub fn builder(client_key: impl Into<String>) -> SessionBuilder {
        SessionBuilder {
            client_key: client_key.into(),
            role: Role::Server,
            peer: false,
            config: SessionConfig::default(),
            metrics: Arc::new(NoopMetrics),
            connect_handler: None,
            client_directory: None,
        }
    }

    /// Process-wide unique session id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn client_key(&self) -> &str {
        &self.inner.client_key
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_peer(&self) -> bool {
        self.inner.peer
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Time spent waiting on the transport since the last liveness reset
    pub fn liveness_stall(&self) -> Duration {
        self.inner.conn.stalled_for()
    }

    /// Logical connections currently in the table
    pub fn connection_count(&self) -> usize {
        self.inner.table.lock().conns.len()
    }

    /// Ids of the logical connections currently in the table
    pub fn connection_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.table.lock().conns.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Why the session ended, once it has
    pub fn close_reason(&self) -> Option<SessionError> {
        self.inner.table.lock().reason.clone()
    }

    /// Resolves once the session has ended
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// End the session and every logical connection on it
    pub fn close(&self) {
        self.terminate(SessionError::Shutdown);
    }

    /// Open a logical connection to `address` on the remote side
    pub async fn dial(&self, proto: &str, address: &str) -> Result<MuxStream, DialError> {
        let request = ConnectRequest::new(proto, address, self.inner.config.dial_timeout);
        self.dial_request(request).await
    }

    /// Open a logical connection with a fully specified Connect payload
    ///
    /// Waits until the remote side accepts, refuses, or the request's
    /// deadline passes. Cancelling the returned future releases the id and
    /// tells the remote side to abort.
    pub async fn dial_request(&self, request: ConnectRequest) -> Result<MuxStream, DialError> {
        let id = self.inner.next_id.fetch_add(2, Ordering::Relaxed);
        let deadline = request.deadline;
        let (conn, established) = LogicalConn::connecting(id, request);

        {
            let mut table = self.inner.table.lock();
            if table.closed {
                return Err(DialError::SessionClosed);
            }
            table.conns.insert(id, conn.clone());
        }
        self.inner.metrics.connection_added(
            &self.inner.client_key,
            &conn.request().proto,
            &conn.request().address,
        );
        debug!(
            session_id = self.id(),
            connection_id = id,
            target = %conn.request(),
            "Dialing"
        );

        let mut pending = PendingDial {
            session: self,
            conn: Some(conn.clone()),
        };

        self.send_frame(Frame::connect(id, conn.request()), None)
            .await
            .map_err(|e| match e {
                HeartbeatError::Closed => DialError::SessionClosed,
                other => DialError::DialFailed(other.to_string()),
            })?;

        match tokio::time::timeout(deadline, established).await {
            Ok(Ok(Ok(()))) => {
                pending.disarm();
                debug!(session_id = self.id(), connection_id = id, "Dial established");
                Ok(MuxStream::new(self.clone(), conn))
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(DialError::SessionClosed),
            Err(_) => {
                debug!(session_id = self.id(), connection_id = id, "Dial timed out");
                Err(DialError::Timeout(deadline))
            }
        }
    }

    async fn run_reader(self) {
        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break SessionError::Shutdown,
                next = self.inner.conn.next_message() => next,
            };

            let data = match next {
                Ok(data) => data,
                Err(e) => {
                    debug!(session_id = self.id(), error = %e, "Transport read failed");
                    break SessionError::from(&e);
                }
            };

            match Frame::decode(data) {
                Ok(frame) => self.dispatch(frame),
                Err(e) => {
                    warn!(session_id = self.id(), error = %e, "Undecodable frame");
                    break SessionError::Decode(e);
                }
            }
        };

        self.terminate(reason);

        if let Err(e) = self.inner.conn.close().await {
            debug!(session_id = self.id(), error = %e, "Transport close failed");
        }
    }

    async fn run_control(self, mut control_rx: mpsc::UnboundedReceiver<Frame>) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => return,
                frame = control_rx.recv() => frame,
            };
            let Some(frame) = frame else {
                return;
            };
            if self.send_frame(frame, None).await.is_err() {
                return;
            }
        }
    }

    async fn run_pinger(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.inner.conn.send_ping().await {
                warn!(session_id = self.id(), error = %e, "Ping failed");
                self.terminate(SessionError::from(&e));
                return;
            }
            trace!(session_id = self.id(), "ping sent");
        }
    }

    fn dispatch(&self, frame: Frame) {
        trace!(
            session_id = self.id(),
            connection_id = frame.connection_id,
            kind = %frame.kind,
            len = frame.payload.len(),
            "frame received"
        );

        match frame.kind {
            FrameKind::Connect => self.handle_connect(frame),
            FrameKind::Connected => {
                if let Some(conn) = self.lookup(frame.connection_id) {
                    conn.mark_established();
                }
            }
            FrameKind::Data => self.handle_data(frame),
            FrameKind::Close => self.handle_close(frame.connection_id),
            FrameKind::Error => self.handle_error(frame.connection_id, frame.text()),
            FrameKind::Pause => {
                if let Some(conn) = self.lookup(frame.connection_id) {
                    debug!(session_id = self.id(), connection_id = conn.id(), "Paused by remote");
                    conn.set_remote_paused(true);
                }
            }
            FrameKind::Resume => {
                if let Some(conn) = self.lookup(frame.connection_id) {
                    debug!(session_id = self.id(), connection_id = conn.id(), "Resumed by remote");
                    conn.set_remote_paused(false);
                }
            }
            FrameKind::AddClient => {
                if let Some(directory) = &self.inner.client_directory {
                    directory.add_remote(&self.inner.client_key, &frame.text());
                }
            }
            FrameKind::RemoveClient => {
                if let Some(directory) = &self.inner.client_directory {
                    directory.remove_remote(&self.inner.client_key, &frame.text());
                }
            }
        }
    }

    fn lookup(&self, id: u64) -> Option<Arc<LogicalConn>> {
        self.inner.table.lock().conns.get(&id).cloned()
    }

    fn handle_data(&self, frame: Frame) {
        let id = frame.connection_id;
        let Some(conn) = self.lookup(id) else {
            trace!(session_id = self.id(), connection_id = id, "Dropping data for unknown connection");
            return;
        };

        let len = frame.payload.len();
        // Pause shares the control queue with Resume so the remote sees them
        // in the order the buffer crossed its marks
        let pushed = conn.push_data(frame.payload, self.inner.config.max_buffer, || {
            self.queue_frame(Frame::pause(id))
        });
        match pushed {
            Push::Dropped => {
                trace!(session_id = self.id(), connection_id = id, "Dropping data after close");
            }
            Push::Buffered => self.inner.metrics.bytes_received(&self.inner.client_key, len),
            Push::Pause => {
                self.inner.metrics.bytes_received(&self.inner.client_key, len);
                debug!(session_id = self.id(), connection_id = id, "Buffer full, pausing remote");
            }
        }
    }

    fn handle_close(&self, id: u64) {
        if self.inner.table.lock().accepting.remove(&id) {
            debug!(session_id = self.id(), connection_id = id, "Connect withdrawn by remote");
            return;
        }
        let Some(conn) = self.lookup(id) else {
            return;
        };
        if conn.remote_close() {
            self.remove_conn(&conn);
        }
    }

    fn handle_error(&self, id: u64, reason: String) {
        if self.inner.table.lock().accepting.remove(&id) {
            debug!(session_id = self.id(), connection_id = id, "Connect aborted by remote");
            return;
        }
        let Some(conn) = self.lookup(id) else {
            return;
        };
        debug!(session_id = self.id(), connection_id = id, reason = %reason, "Connection error from remote");
        conn.fail(Failure::Remote(reason));
        self.remove_conn(&conn);
    }

    fn handle_connect(&self, frame: Frame) {
        let id = frame.connection_id;
        let request = match ConnectRequest::decode(&frame.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(session_id = self.id(), connection_id = id, error = %e, "Invalid connect");
                self.queue_frame(Frame::error(id, &e.to_string()));
                return;
            }
        };

        let Some(handler) = self.inner.connect_handler.clone() else {
            debug!(session_id = self.id(), connection_id = id, "Refusing connect");
            self.queue_frame(Frame::error(id, "connect not allowed"));
            return;
        };

        {
            let mut table = self.inner.table.lock();
            if table.closed {
                return;
            }
            if table.conns.contains_key(&id) || !table.accepting.insert(id) {
                drop(table);
                warn!(session_id = self.id(), connection_id = id, "Duplicate connection id");
                self.queue_frame(Frame::error(id, "duplicate connection id"));
                return;
            }
        }

        tokio::spawn(self.clone().accept_connect(id, request, handler));
    }

    async fn accept_connect(self, id: u64, request: ConnectRequest, handler: Arc<dyn ConnectHandler>) {
        debug!(session_id = self.id(), connection_id = id, target = %request, "Accepting connect");

        let upstream = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return,
            result = tokio::time::timeout(request.deadline, handler.connect(&request)) => match result {
                Ok(Ok(upstream)) => Ok(upstream),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(DialError::Timeout(request.deadline)),
            },
        };

        let upstream = match upstream {
            Ok(upstream) => upstream,
            Err(e) => {
                debug!(session_id = self.id(), connection_id = id, error = %e, "Target dial failed");
                let withdrawn = !self.inner.table.lock().accepting.remove(&id);
                if !withdrawn {
                    let _ = self.send_frame(Frame::error(id, &e.to_string()), None).await;
                }
                return;
            }
        };

        let conn = LogicalConn::established(id, request);
        {
            let mut table = self.inner.table.lock();
            if !table.accepting.remove(&id) || table.closed {
                // Withdrawn while dialing, or the session is gone
                return;
            }
            table.conns.insert(id, conn.clone());
        }
        self.inner.metrics.connection_added(
            &self.inner.client_key,
            &conn.request().proto,
            &conn.request().address,
        );

        let stream = MuxStream::new(self.clone(), conn);
        if self.send_frame(Frame::connected(id), None).await.is_err() {
            return;
        }

        match bridge(stream, upstream).await {
            Ok((sent, received)) => {
                debug!(session_id = self.id(), connection_id = id, sent, received, "Connection finished");
            }
            Err(e) => {
                debug!(session_id = self.id(), connection_id = id, error = %e, "Connection ended with error");
            }
        }
    }

    /// Serialize one frame onto the transport
    ///
    /// Errors other than an expired caller deadline end the session.
    pub(crate) async fn send_frame(
        &self,
        frame: Frame,
        deadline: Option<Instant>,
    ) -> Result<(), HeartbeatError> {
        if self.is_closed() {
            return Err(HeartbeatError::Closed);
        }

        let encoded = frame
            .encode()
            .map_err(|e| HeartbeatError::Transport(TransportError::ProtocolError(e.to_string())))?;
        trace!(
            session_id = self.id(),
            connection_id = frame.connection_id,
            kind = %frame.kind,
            len = frame.payload.len(),
            "frame sent"
        );

        match self.inner.conn.write_message(Message::Binary(encoded), deadline).await {
            Ok(()) => Ok(()),
            Err(e) if !e.is_fatal() => Err(e),
            Err(e) => {
                warn!(session_id = self.id(), error = %e, "Transport write failed");
                self.terminate(SessionError::from(&e));
                Err(e)
            }
        }
    }

    /// Send a frame from a context that cannot wait; frames queued here are
    /// written in order
    pub(crate) fn queue_frame(&self, frame: Frame) {
        let _ = self.inner.control_tx.send(frame);
    }

    pub(crate) async fn write_data(
        &self,
        conn: &LogicalConn,
        data: Bytes,
        write_timeout: Option<Duration>,
    ) -> io::Result<()> {
        let deadline = write_timeout.map(|timeout| Instant::now() + timeout);
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, conn.wait_writable())
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded while paused")
                })??,
            None => conn.wait_writable().await?,
        }

        let len = data.len();
        match self.send_frame(Frame::data(conn.id(), data), deadline).await {
            Ok(()) => {
                conn.touch();
                self.inner.metrics.bytes_transmitted(&self.inner.client_key, len);
                Ok(())
            }
            Err(e) => {
                self.inner.metrics.bytes_transmit_error(&self.inner.client_key, len);
                Err(write_io_error(e))
            }
        }
    }

    pub(crate) async fn shutdown_write(&self, conn: &Arc<LogicalConn>) -> io::Result<()> {
        let Some(fully_closed) = conn.local_close() else {
            return Ok(());
        };
        if fully_closed {
            self.remove_conn(conn);
        }
        self.send_frame(Frame::close(conn.id()), None)
            .await
            .map_err(write_io_error)
    }

    /// The handle for `conn` is gone
    pub(crate) fn release(&self, conn: &Arc<LogicalConn>) {
        if conn.abandon() && !self.is_closed() {
            self.queue_frame(Frame::close(conn.id()));
        }
        self.remove_conn(conn);
    }

    fn remove_conn(&self, conn: &Arc<LogicalConn>) {
        let removed = {
            let mut table = self.inner.table.lock();
            match table.conns.get(&conn.id()) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    table.conns.remove(&conn.id());
                    true
                }
                _ => false,
            }
        };

        if removed {
            debug!(session_id = self.id(), connection_id = conn.id(), "Connection removed");
            self.inner.metrics.connection_removed(
                &self.inner.client_key,
                &conn.request().proto,
                &conn.request().address,
            );
        }
    }

    /// End the session: every logical connection fails exactly once and
    /// the transport is closed. Later calls are no-ops.
    pub(crate) fn terminate(&self, reason: SessionError) {
        let conns: Vec<Arc<LogicalConn>> = {
            let mut table = self.inner.table.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            table.reason = Some(reason.clone());
            table.accepting.clear();
            table.conns.drain().map(|(_, conn)| conn).collect()
        };

        match &reason {
            SessionError::Shutdown | SessionError::Replaced | SessionError::TransportClosed => info!(
                session_id = self.id(),
                client_key = %self.inner.client_key,
                connections = conns.len(),
                reason = %reason,
                "Session closed"
            ),
            _ => warn!(
                session_id = self.id(),
                client_key = %self.inner.client_key,
                connections = conns.len(),
                reason = %reason,
                "Session failed"
            ),
        }

        let failure = Failure::Session(reason.to_string());
        for conn in conns {
            conn.fail(failure.clone());
            self.inner.metrics.connection_removed(
                &self.inner.client_key,
                &conn.request().proto,
                &conn.request().address,
            );
        }

        self.inner.shutdown.cancel();
    }
}

/// Releases a dial's id unless the dial completed
struct PendingDial<'a> {
    session: &'a Session,
    conn: Option<Arc<LogicalConn>>,
}

impl PendingDial<'_> {
    fn disarm(&mut self) {
        self.conn = None;
    }
}

impl Drop for PendingDial<'_> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        // Already failed means the remote refused; nothing to tell it
        if conn.fail(Failure::Aborted("dial abandoned".to_string())) && !self.session.is_closed() {
            self.session
                .queue_frame(Frame::error(conn.id(), "dial abandoned"));
        }
        self.session.remove_conn(&conn);
    }
}
