//! Transport abstraction traits for Relay.
//!
//! These traits define the interface every transport must provide, allowing
//! the session handler to be transport-agnostic.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Tie-breaker so IDs generated within the same nanosecond stay distinct.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A frame received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A UTF-8 text frame.
    Text(String),
    /// A binary frame. Only its length is kept; the chat protocol is text-only.
    Binary(usize),
}

/// The server-to-client half of a connection.
#[async_trait]
pub trait MessageSink: Send {
    /// Send a text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the connection gracefully. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// The client-to-server half of a connection.
#[async_trait]
pub trait MessageSource: Send {
    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` if the client closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError>;
}

/// An accepted connection over a transport.
pub trait Connection: Send {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently owned write and read halves.
    fn split(self: Box<Self>) -> (Box<dyn MessageSink>, Box<dyn MessageSource>);
}
