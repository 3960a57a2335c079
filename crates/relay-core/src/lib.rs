//! # relay-core
//!
//! Core of the Relay chat fan-out server.
//!
//! This crate provides the building blocks a server wires together:
//!
//! - **Registry** - the live set of client connections and local broadcast
//! - **Store / Bus** - facades over the persistence and pub/sub backends
//! - **Supervisor** - bounded-retry startup with a degraded fallback per backend
//! - **Fanout** - bridges the bus subscription into local broadcast
//! - **Hub** - routes a message: persist, then publish or broadcast
//! - **Session** - per-connection lifecycle
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Session    │────▶│    Hub      │────▶│   Store     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        │                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Registry   │◀────│   Fanout    │◀────│    Bus      │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! When the bus is degraded the hub skips the bus and broadcasts into the
//! registry directly, so a single instance keeps working on its own.

pub mod bus;
pub mod fanout;
pub mod hub;
pub mod message;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod store;
pub mod supervisor;

pub use bus::{BusError, BusFacade, MemoryBus, MessageBus, PayloadStream};
pub use fanout::{FanoutBridge, FanoutStats};
pub use hub::{Delivery, Hub, HubSettings, HubStatus, RouteReport};
pub use message::{ChatMessage, MonotonicClock, RecordId, StoredMessage};
pub use registry::{BroadcastReport, ConnectionRegistry, Payload};
pub use session::{CloseReason, SessionHandler, SessionSummary, SEND_TIMEOUT};
pub use store::{AppendOutcome, MemoryStore, MessageStore, StoreError, StoreFacade};
pub use supervisor::{
    BackendState, BackendStatus, BusStartup, RetryPolicy, StartupSupervisor, BACKEND_TIMEOUT,
};

#[cfg(feature = "redis")]
pub use bus::RedisBus;

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
