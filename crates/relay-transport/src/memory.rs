//! In-memory transport.
//!
//! A [`MemoryConnection`] is the server side of a duplex channel pair; the
//! matching [`MemoryPeer`] plays the client. Useful for driving sessions in
//! tests without opening sockets.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{
    Connection, ConnectionId, Incoming, MessageSink, MessageSource, TransportError,
};

/// What a peer can put on the wire.
#[derive(Debug)]
enum PeerFrame {
    Frame(Incoming),
    Close,
    Fault(String),
}

/// Server side of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<PeerFrame>,
}

/// Client side of an in-memory connection.
pub struct MemoryPeer {
    outbound: mpsc::UnboundedSender<PeerFrame>,
    inbound: mpsc::UnboundedReceiver<String>,
}

impl MemoryConnection {
    /// Create a connected pair.
    #[must_use]
    pub fn pair() -> (MemoryConnection, MemoryPeer) {
        Self::pair_with_id(ConnectionId::generate())
    }

    /// Create a connected pair with a fixed connection ID.
    #[must_use]
    pub fn pair_with_id(id: impl Into<ConnectionId>) -> (MemoryConnection, MemoryPeer) {
        let (to_server, from_peer) = mpsc::unbounded_channel();
        let (to_peer, from_server) = mpsc::unbounded_channel();

        let conn = MemoryConnection {
            id: id.into(),
            outbound: to_peer,
            inbound: from_peer,
        };
        let peer = MemoryPeer {
            outbound: to_server,
            inbound: from_server,
        };
        (conn, peer)
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageSource>) {
        (
            Box::new(MemorySink {
                outbound: Some(self.outbound),
            }),
            Box::new(MemorySource {
                inbound: self.inbound,
            }),
        )
    }
}

struct MemorySink {
    outbound: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        match &self.outbound {
            Some(tx) => tx.send(text).map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound = None;
        Ok(())
    }
}

struct MemorySource {
    inbound: mpsc::UnboundedReceiver<PeerFrame>,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        match self.inbound.recv().await {
            Some(PeerFrame::Frame(frame)) => Ok(Some(frame)),
            Some(PeerFrame::Close) | None => Ok(None),
            Some(PeerFrame::Fault(reason)) => Err(TransportError::ReceiveFailed(reason)),
        }
    }
}

impl MemoryPeer {
    /// Send a text frame to the server. Returns `false` once the server is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outbound
            .send(PeerFrame::Frame(Incoming::Text(text.into())))
            .is_ok()
    }

    /// Send a binary frame of the given length.
    pub fn send_binary(&self, len: usize) -> bool {
        self.outbound
            .send(PeerFrame::Frame(Incoming::Binary(len)))
            .is_ok()
    }

    /// Close the connection gracefully.
    pub fn close(&self) {
        let _ = self.outbound.send(PeerFrame::Close);
    }

    /// Make the server's next receive fail with a transport error.
    pub fn fault(&self, reason: impl Into<String>) {
        let _ = self.outbound.send(PeerFrame::Fault(reason.into()));
    }

    /// Receive the next frame from the server.
    ///
    /// Returns `None` once the server has closed its side.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.inbound.try_recv().ok()
    }
}
