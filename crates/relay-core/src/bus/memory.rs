//! In-process bus.
//!
//! Several hubs sharing one `MemoryBus` behave like several instances
//! sharing a pub/sub server.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::{BusError, MessageBus, PayloadStream};

/// Per-topic buffer before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 1024;

/// A pub/sub bus that lives inside the process.
#[derive(Debug, Default)]
pub struct MemoryBus {
    topics: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Drop a topic. Open subscriptions to it end.
    pub fn close_topic(&self, topic: &str) -> bool {
        let closed = self.topics.remove(topic).is_some();
        if closed {
            debug!(topic = %topic, "Closed topic");
        }
        closed
    }

    #[cfg(test)]
    fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn ping(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        // Publishing with no subscribers is not an error, same as a real broker
        let _ = self.sender(topic).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BusError> {
        let receiver = self.sender(topic).subscribe();
        let topic = topic.to_string();

        let feed = stream::unfold(receiver, move |mut receiver| {
            let topic = topic.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((Ok(payload), receiver)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(feed.boxed())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
