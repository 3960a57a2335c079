//! Cross-instance pub/sub for Relay.
//!
//! Every instance publishes live messages to one topic and subscribes to the
//! same topic; the fanout bridge turns the subscription back into local
//! broadcasts. [`BusFacade`] fails fast once the bus is degraded so callers
//! can fall back to broadcasting locally.

mod memory;
#[cfg(feature = "redis")]
mod redis_bus;

pub use memory::MemoryBus;
#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::supervisor::{BackendState, BackendStatus, BACKEND_TIMEOUT};

/// An endless stream of payloads received on a topic.
pub type PayloadStream = BoxStream<'static, Result<String, BusError>>;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// No bus is connected.
    #[error("Bus unavailable")]
    Unavailable,

    /// The bus did not answer in time.
    #[error("Bus call timed out")]
    Timeout,

    /// Connecting or probing failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publishing failed.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The subscription failed or broke.
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

/// A pub/sub backend.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<(), BusError>;

    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError>;

    /// Subscribe to a topic.
    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BusError>;

    /// Short backend name for status reporting.
    fn backend_name(&self) -> &'static str;
}

/// Degradable front for a [`MessageBus`], bound to one topic.
#[derive(Clone)]
pub struct BusFacade {
    backend: Option<Arc<dyn MessageBus>>,
    status: Arc<BackendStatus>,
    topic: Arc<str>,
}

impl BusFacade {
    pub(crate) fn from_parts(
        backend: Option<Arc<dyn MessageBus>>,
        status: Arc<BackendStatus>,
        topic: &str,
    ) -> Self {
        Self {
            backend,
            status,
            topic: Arc::from(topic),
        }
    }

    /// A facade over an already connected backend.
    #[must_use]
    pub fn connected(backend: Arc<dyn MessageBus>, topic: &str) -> Self {
        let status = Arc::new(BackendStatus::new("bus", BackendState::Connected));
        Self::from_parts(Some(backend), status, topic)
    }

    /// A facade with no backend.
    #[must_use]
    pub fn degraded(topic: &str) -> Self {
        let status = Arc::new(BackendStatus::new("bus", BackendState::Degraded));
        Self::from_parts(None, status, topic)
    }

    /// Current backend state.
    #[must_use]
    pub fn state(&self) -> BackendState {
        self.status.state()
    }

    /// Shared state handle, handed to the fanout bridge.
    #[must_use]
    pub fn status(&self) -> Arc<BackendStatus> {
        Arc::clone(&self.status)
    }

    /// The topic this facade publishes to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Check if publishing reaches a backend.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.backend.is_some() && self.state() == BackendState::Connected
    }

    /// Name of the connected backend, if any.
    #[must_use]
    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.backend_name())
    }

    /// Publish a payload to the topic.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unavailable`] without touching the network when
    /// the bus is degraded, or the backend's error if publishing fails.
    pub async fn publish(&self, payload: &str) -> Result<(), BusError> {
        let backend = match &self.backend {
            Some(backend) if self.state() == BackendState::Connected => backend,
            _ => return Err(BusError::Unavailable),
        };

        match tokio::time::timeout(BACKEND_TIMEOUT, backend.publish(&self.topic, payload)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(topic = %self.topic, "Publish timed out");
                Err(BusError::Timeout)
            }
        }
    }
}

impl std::fmt::Debug for BusFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusFacade")
            .field("backend", &self.backend_name())
            .field("state", &self.state())
            .field("topic", &self.topic)
            .finish()
    }
}
