//! WebSocket transport implementation.
//!
//! Wraps an upgraded axum [`WebSocket`]. The HTTP listener and the upgrade
//! handshake belong to the server; this module only adapts the socket.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::{debug, trace};

use crate::traits::{
    Connection, ConnectionId, Incoming, MessageSink, MessageSource, TransportError,
};

/// An upgraded WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket, assigning it a fresh connection ID.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::generate(),
            socket,
            remote_addr,
        }
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageSource>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(WebSocketSink {
                inner: sink,
                closed: false,
            }),
            Box::new(WebSocketSource { inner: stream }),
        )
    }
}

/// Write half of a [`WebSocketConnection`].
pub struct WebSocketSink {
    inner: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl MessageSink for WebSocketSink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.inner
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}

/// Read half of a [`WebSocketConnection`].
pub struct WebSocketSource {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl MessageSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Incoming::Text(text))),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Incoming::Binary(data.len()))),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pongs are queued by the socket itself
                    trace!("Keepalive frame");
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}
