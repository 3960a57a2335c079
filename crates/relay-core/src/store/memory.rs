//! In-process message store.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{MessageStore, StoreError};
use crate::message::{ChatMessage, RecordId, StoredMessage};

/// A message store held in memory. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Kept sorted by `(timestamp, id)`.
    messages: RwLock<Vec<StoredMessage>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn append(&self, message: &ChatMessage) -> Result<RecordId, StoreError> {
        let mut messages = self.messages.write().await;
        let id = RecordId(messages.len() as i64 + 1);
        let key = (message.timestamp, id);
        let at = messages.partition_point(|m| (m.message.timestamp, m.id) <= key);
        messages.insert(
            at,
            StoredMessage {
                id,
                message: message.clone(),
            },
        );
        Ok(id)
    }

    async fn recent_ordered(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = self.messages.read().await;
        let skip = messages.len().saturating_sub(limit);
        Ok(messages[skip..].to_vec())
    }

    async fn latest(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages.iter().rev().take(limit).cloned().collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.messages.read().await.len() as u64)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
