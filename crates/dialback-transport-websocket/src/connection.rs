//! Adapters from a tungstenite stream to the session's message halves

use async_trait::async_trait;
use bytes::Bytes;
use dialback_transport::{Message, MessageSink, MessageSource, Transport, TransportError, TransportResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

/// Split an established WebSocket into a [`Transport`]
pub fn into_transport<S>(ws_stream: WebSocketStream<S>, remote_addr: Option<SocketAddr>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection_id = format!("ws-{}", uuid::Uuid::new_v4());
    let (sink, stream) = ws_stream.split();

    let mut transport = Transport::new(
        WebSocketSink {
            connection_id: connection_id.clone(),
            inner: sink,
        },
        WebSocketSource {
            connection_id: connection_id.clone(),
            inner: stream,
        },
    )
    .with_connection_id(connection_id);

    if let Some(addr) = remote_addr {
        transport = transport.with_remote_addr(addr);
    }
    transport
}

pub struct WebSocketSink<S> {
    connection_id: String,
    inner: SplitSink<WebSocketStream<S>, WsMessage>,
}

impl<S> std::fmt::Debug for WebSocketSink<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSink")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[async_trait]
impl<S> MessageSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, message: Message) -> TransportResult<()> {
        trace!(connection_id = %self.connection_id, kind = message.kind(), "websocket send");
        if let Message::Pong(_) = message {
            // tungstenite already queued a pong for every ping it read
            return Ok(());
        }
        self.inner.send(to_ws(message)).await.map_err(map_ws_error)
    }

    async fn close(&mut self) -> TransportResult<()> {
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(map_ws_error(e)),
        }
    }
}

pub struct WebSocketSource<S> {
    connection_id: String,
    inner: SplitStream<WebSocketStream<S>>,
}

impl<S> std::fmt::Debug for WebSocketSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSource")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[async_trait]
impl<S> MessageSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_message(&mut self) -> TransportResult<Option<Message>> {
        loop {
            let message = match self.inner.next().await {
                None => return Ok(None),
                Some(Ok(message)) => message,
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    return Ok(None)
                }
                Some(Err(e)) => return Err(map_ws_error(e)),
            };

            match message {
                WsMessage::Binary(data) => return Ok(Some(Message::Binary(Bytes::from(data)))),
                WsMessage::Ping(data) => return Ok(Some(Message::Ping(Bytes::from(data)))),
                WsMessage::Pong(data) => return Ok(Some(Message::Pong(Bytes::from(data)))),
                WsMessage::Close(_) => return Ok(Some(Message::Close)),
                WsMessage::Text(_) => {
                    return Err(TransportError::ProtocolError(
                        "text message on a binary transport".to_string(),
                    ))
                }
                // Raw frames are never produced while reading
                WsMessage::Frame(_) => continue,
            }
        }
    }
}

fn to_ws(message: Message) -> WsMessage {
    match message {
        Message::Binary(data) => WsMessage::Binary(data.to_vec()),
        Message::Ping(data) => WsMessage::Ping(data.to_vec()),
        Message::Pong(data) => WsMessage::Pong(data.to_vec()),
        Message::Close => WsMessage::Close(None),
    }
}

fn map_ws_error(error: WsError) -> TransportError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        WsError::Io(e) => TransportError::IoError(e),
        WsError::Protocol(e) => TransportError::ProtocolError(e.to_string()),
        WsError::Capacity(e) => TransportError::ProtocolError(e.to_string()),
        other => TransportError::ConnectionError(other.to_string()),
    }
}
