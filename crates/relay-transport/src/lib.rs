//! # relay-transport
//!
//! Connection abstraction for the Relay chat server.
//!
//! A [`Connection`] is accepted once and then split into a [`MessageSink`]
//! (server to client) and a [`MessageSource`] (client to server), so a
//! session can write and read concurrently without sharing a lock.
//!
//! - **WebSocket** - axum WebSocket upgrade, used by the server
//! - **Memory** - a duplex pair of channels, used by tests
//!
//! ```rust,ignore
//! use relay_transport::{Connection, Incoming};
//!
//! async fn echo(conn: Box<dyn Connection>) {
//!     let (mut sink, mut source) = conn.split();
//!     while let Ok(Some(Incoming::Text(text))) = source.recv().await {
//!         let _ = sink.send(text).await;
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryConnection, MemoryPeer};
pub use traits::{Connection, ConnectionId, Incoming, MessageSink, MessageSource, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;
