//! Message persistence for Relay.
//!
//! [`MessageStore`] is the backend contract. [`StoreFacade`] is what the rest
//! of the server talks to: it bounds every call with [`BACKEND_TIMEOUT`] and
//! turns a degraded backend into no-op writes and empty reads.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite_store;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteStore;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::message::{ChatMessage, RecordId, StoredMessage};
use crate::supervisor::{BackendState, BackendStatus, BACKEND_TIMEOUT};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No backend is connected.
    #[error("Store unavailable")]
    Unavailable,

    /// The backend did not answer in time.
    #[error("Store call timed out")]
    Timeout,

    /// The backend rejected the call.
    #[error("Database error: {0}")]
    Database(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A persistent, ordered collection of chat messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Persist a message and return its identifier.
    async fn append(&self, message: &ChatMessage) -> Result<RecordId, StoreError>;

    /// The `limit` newest messages, oldest first.
    async fn recent_ordered(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;

    /// The `limit` newest messages, newest first.
    async fn latest(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;

    /// Total number of stored messages.
    async fn count(&self) -> Result<u64, StoreError>;

    /// Short backend name for status reporting.
    fn backend_name(&self) -> &'static str;
}

/// Result of [`StoreFacade::append`].
#[derive(Debug)]
pub enum AppendOutcome {
    /// The message was persisted.
    Stored(RecordId),
    /// The store is degraded; nothing was written.
    Degraded,
    /// The backend is connected but the write failed.
    Failed(StoreError),
}

impl AppendOutcome {
    /// The record ID, if the message was persisted.
    #[must_use]
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            AppendOutcome::Stored(id) => Some(*id),
            _ => None,
        }
    }
}

/// Degradable front for a [`MessageStore`].
#[derive(Clone)]
pub struct StoreFacade {
    backend: Option<Arc<dyn MessageStore>>,
    status: Arc<BackendStatus>,
}

impl StoreFacade {
    pub(crate) fn from_parts(
        backend: Option<Arc<dyn MessageStore>>,
        status: Arc<BackendStatus>,
    ) -> Self {
        Self { backend, status }
    }

    /// A facade over an already connected backend.
    #[must_use]
    pub fn connected(backend: Arc<dyn MessageStore>) -> Self {
        let status = Arc::new(BackendStatus::new("store", BackendState::Connected));
        Self::from_parts(Some(backend), status)
    }

    /// A facade with no backend.
    #[must_use]
    pub fn degraded() -> Self {
        let status = Arc::new(BackendStatus::new("store", BackendState::Degraded));
        Self::from_parts(None, status)
    }

    /// Current backend state.
    #[must_use]
    pub fn state(&self) -> BackendState {
        self.status.state()
    }

    /// Check if writes and reads reach a backend.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.backend.is_some() && self.state() == BackendState::Connected
    }

    /// Name of the connected backend, if any.
    #[must_use]
    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.backend_name())
    }

    fn available_backend(&self) -> Option<&Arc<dyn MessageStore>> {
        if self.state() == BackendState::Connected {
            self.backend.as_ref()
        } else {
            None
        }
    }

    /// Persist a message.
    pub async fn append(&self, message: &ChatMessage) -> AppendOutcome {
        let Some(backend) = self.available_backend() else {
            return AppendOutcome::Degraded;
        };

        match bounded(backend.append(message)).await {
            Ok(id) => AppendOutcome::Stored(id),
            Err(e) => AppendOutcome::Failed(e),
        }
    }

    /// The `limit` newest messages, oldest first. Empty when degraded.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend call fails or times out.
    pub async fn recent_ordered(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        match self.available_backend() {
            Some(backend) => bounded(backend.recent_ordered(limit)).await,
            None => Ok(Vec::new()),
        }
    }

    /// The `limit` newest messages, newest first. Empty when degraded.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend call fails or times out.
    pub async fn latest(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        match self.available_backend() {
            Some(backend) => bounded(backend.latest(limit)).await,
            None => Ok(Vec::new()),
        }
    }

    /// Total number of stored messages. Zero when degraded.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend call fails or times out.
    pub async fn count(&self) -> Result<u64, StoreError> {
        match self.available_backend() {
            Some(backend) => bounded(backend.count()).await,
            None => Ok(0),
        }
    }
}

impl std::fmt::Debug for StoreFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreFacade")
            .field("backend", &self.backend_name())
            .field("state", &self.state())
            .finish()
    }
}

async fn bounded<T>(
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(BACKEND_TIMEOUT, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout = ?BACKEND_TIMEOUT, "Store call timed out");
            Err(StoreError::Timeout)
        }
    }
}
