//! Redis pub/sub bus.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::{debug, warn};

use super::{BusError, MessageBus, PayloadStream};
use crate::supervisor::BACKEND_TIMEOUT;

/// A bus backed by a Redis server.
///
/// Commands share one multiplexed connection; every subscription opens a
/// dedicated pub/sub connection, as Redis requires.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisBus {
    /// Connect to the server at `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server cannot be
    /// reached within [`BACKEND_TIMEOUT`].
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = Client::open(url).map_err(|e| BusError::Connection(e.to_string()))?;

        let conn = tokio::time::timeout(BACKEND_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| BusError::Timeout)?
            .map_err(|e| BusError::Connection(e.to_string()))?;

        debug!("Connected to Redis");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(topic, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        debug!(topic = %topic, receivers, "Published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream, BusError> {
        let mut pubsub = tokio::time::timeout(BACKEND_TIMEOUT, self.client.get_async_pubsub())
            .await
            .map_err(|_| BusError::Timeout)?
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        debug!(topic = %topic, "Subscribed");

        let feed = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(Ok::<_, BusError>(payload)),
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable bus payload");
                    None
                }
            }
        });

        Ok(feed.boxed())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
