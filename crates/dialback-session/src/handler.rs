//! Accepting inbound Connects
//!
//! The session hands each accepted Connect to a [`ConnectHandler`], which
//! produces the upstream byte stream, and then pumps bytes between the
//! logical connection and that stream until both sides are done.

use async_trait::async_trait;
use dialback_proto::ConnectRequest;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::connection::MuxStream;
use crate::error::DialError;
use crate::manager::WeakSessionManager;

/// Any bidirectional byte stream a logical connection can be bridged to
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> UpstreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type Upstream = Box<dyn UpstreamIo>;

/// Decides whether an inbound Connect is allowed and dials its target
#[async_trait]
pub trait ConnectHandler: Send + Sync + std::fmt::Debug {
    async fn connect(&self, request: &ConnectRequest) -> Result<Upstream, DialError>;
}

/// Copy bytes both ways between a logical connection and its upstream
///
/// EOF on one side half-closes the other. Returns (bytes to upstream,
/// bytes to the logical connection).
pub async fn bridge(mut stream: MuxStream, mut upstream: Upstream) -> io::Result<(u64, u64)> {
    let id = stream.id();
    debug!(connection_id = id, target = %stream.address(), "Bridging connection");

    let result = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    if let Err(e) = &result {
        debug!(connection_id = id, error = %e, "Bridge ended with error");
    }
    result
}

/// Serves Connects arriving over a peer link by dialing the named client
/// through a local session
///
/// Only one hop is taken: a client that is not attached locally is not
/// forwarded on to further peers.
#[derive(Debug, Clone)]
pub struct PeerDialHandler {
    manager: WeakSessionManager,
}

impl PeerDialHandler {
    pub fn new(manager: WeakSessionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ConnectHandler for PeerDialHandler {
    async fn connect(&self, request: &ConnectRequest) -> Result<Upstream, DialError> {
        let Some((client_key, proto)) = request.client_target() else {
            return Err(DialError::DialFailed(format!(
                "peer connect without client key: {}",
                request.proto
            )));
        };
        let manager = self.manager.upgrade().ok_or(DialError::SessionClosed)?;

        debug!(client_key = %client_key, proto = %proto, address = %request.address, "Dialing for peer");
        let target = ConnectRequest::new(proto, request.address.clone(), request.deadline);
        let stream = manager.dial_local(client_key, target).await?;
        Ok(Box::new(stream))
    }
}
