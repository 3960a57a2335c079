//! Message routing for Relay.
//!
//! The hub ties the registry to the two backends. Routing an accepted
//! message always runs in the same order: timestamp, persist, encode, then
//! publish to the bus, or broadcast locally when the bus cannot take it.

use relay_protocol::{encode, InboundMessage, MessageData, ProtocolError, MAX_INBOUND_SIZE};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::bus::BusFacade;
use crate::message::{ChatMessage, MonotonicClock, RecordId};
use crate::metrics;
use crate::registry::{BroadcastReport, ConnectionRegistry};
use crate::store::{AppendOutcome, StoreFacade};
use crate::supervisor::BackendState;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Messages replayed to a new connection.
    pub history_limit: usize,
    /// Per-connection outbound queue length.
    pub outbound_queue: usize,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            history_limit: 100,
            outbound_queue: 256,
            max_message_size: MAX_INBOUND_SIZE,
        }
    }
}

/// How a routed message left this instance.
#[derive(Debug)]
pub enum Delivery {
    /// Handed to the bus; the fanout bridge delivers it.
    Published,
    /// Broadcast straight into the local registry.
    Broadcast(BroadcastReport),
}

/// Outcome of [`Hub::route`].
#[derive(Debug)]
pub struct RouteReport {
    /// The message as accepted.
    pub message: ChatMessage,
    /// Store identifier, when the message was persisted.
    pub record_id: Option<RecordId>,
    /// Delivery path taken.
    pub delivery: Delivery,
}

/// Point-in-time view of the hub, for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStatus {
    /// Store state.
    pub store: BackendState,
    /// Bus state.
    pub bus: BackendState,
    /// Registered connections.
    pub active_connections: usize,
}

/// Routes messages between sessions, the store and the bus.
#[derive(Debug)]
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    store: StoreFacade,
    bus: BusFacade,
    clock: MonotonicClock,
    settings: HubSettings,
}

impl Hub {
    /// Create a hub over the given registry and backends.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: StoreFacade,
        bus: BusFacade,
        settings: HubSettings,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            clock: MonotonicClock::new(),
            settings,
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The store facade.
    #[must_use]
    pub fn store(&self) -> &StoreFacade {
        &self.store
    }

    /// The bus facade.
    #[must_use]
    pub fn bus(&self) -> &BusFacade {
        &self.bus
    }

    /// Hub settings.
    #[must_use]
    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Recent messages for a new connection, oldest first.
    ///
    /// Never fails: a degraded or failing store yields an empty list.
    pub async fn history(&self) -> Vec<MessageData> {
        match self.store.recent_ordered(self.settings.history_limit).await {
            Ok(messages) => messages.iter().map(|m| m.message.to_data()).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to load history, sending none");
                metrics::record_error("store_history");
                Vec::new()
            }
        }
    }

    /// Accept a validated inbound message and send it on its way.
    ///
    /// Store and bus failures are logged and absorbed.
    ///
    /// # Errors
    ///
    /// Returns an error only if the outbound envelope cannot be encoded.
    pub async fn route(&self, inbound: InboundMessage) -> Result<RouteReport, ProtocolError> {
        let started = Instant::now();
        let message = ChatMessage::from_inbound(inbound, self.clock.now());

        let outcome = self.store.append(&message).await;
        match &outcome {
            AppendOutcome::Stored(id) => debug!(id = %id, "Stored message"),
            AppendOutcome::Degraded => debug!("Store degraded, message not persisted"),
            AppendOutcome::Failed(e) => {
                warn!(error = %e, "Failed to store message");
                metrics::record_error("store_append");
            }
        }
        let record_id = outcome.record_id();

        let payload = encode(&message.to_envelope())?;
        let delivery = self.deliver(payload).await;
        metrics::record_latency(started.elapsed().as_secs_f64());

        Ok(RouteReport {
            message,
            record_id,
            delivery,
        })
    }

    async fn deliver(&self, payload: String) -> Delivery {
        if self.bus.is_available() {
            match self.bus.publish(&payload).await {
                Ok(()) => return Delivery::Published,
                Err(e) => {
                    warn!(error = %e, "Publish failed, broadcasting locally");
                    metrics::record_error("bus_publish");
                }
            }
        }

        metrics::record_message(payload.len(), metrics::OUTBOUND);
        Delivery::Broadcast(self.registry.broadcast(Arc::from(payload)))
    }

    /// Current backend states and connection count.
    #[must_use]
    pub fn snapshot(&self) -> HubStatus {
        HubStatus {
            store: self.store.state(),
            bus: self.bus.state(),
            active_connections: self.registry.len(),
        }
    }

    /// Total persisted messages, or `None` if the store could not be asked.
    pub async fn total_messages(&self) -> Option<u64> {
        match self.store.count().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(error = %e, "Failed to count messages");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, MemoryBus, MessageBus, PayloadStream};
    use crate::fanout::FanoutBridge;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use relay_protocol::{decode, Envelope};
    use tokio::sync::mpsc;

    fn degraded_hub() -> Hub {
        Hub::new(
            Arc::new(ConnectionRegistry::new()),
            StoreFacade::degraded(),
            BusFacade::degraded("chat"),
            HubSettings::default(),
        )
    }

    fn listen(hub: &Hub, id: &str) -> mpsc::Receiver<Arc<str>> {
        let (tx, rx) = mpsc::channel(16);
        hub.registry().register(id.into(), tx);
        rx
    }

    fn live_message(payload: &str) -> MessageData {
        match decode(payload).unwrap() {
            Envelope::Message(data) => data,
            other => panic!("Expected message envelope, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fully_degraded_still_delivers_locally() {
        let hub = degraded_hub();
        let mut rx = listen(&hub, "conn-b");

        let report = hub.route(InboundMessage::new("alice", "hi")).await.unwrap();
        assert!(report.record_id.is_none());
        match report.delivery {
            Delivery::Broadcast(b) => assert_eq!(b.delivered, 1),
            Delivery::Published => panic!("Expected local broadcast"),
        }

        let data = live_message(&rx.recv().await.unwrap());
        assert_eq!(data.username, "alice");
        assert_eq!(data.message, "hi");
        assert!(hub.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_persisted_message_reappears_in_history() {
        let hub = Hub::new(
            Arc::new(ConnectionRegistry::new()),
            StoreFacade::connected(Arc::new(MemoryStore::new())),
            BusFacade::degraded("chat"),
            HubSettings::default(),
        );

        let report = hub.route(InboundMessage::new("alice", "hi")).await.unwrap();
        assert!(report.record_id.is_some());

        let history = hub.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].username, "alice");
        assert_eq!(history[0].message, "hi");
        assert_eq!(history[0], report.message.to_data());
        assert_eq!(hub.total_messages().await, Some(1));
    }

    #[tokio::test]
    async fn test_history_is_capped_and_ascending() {
        let hub = Hub::new(
            Arc::new(ConnectionRegistry::new()),
            StoreFacade::connected(Arc::new(MemoryStore::new())),
            BusFacade::degraded("chat"),
            HubSettings {
                history_limit: 5,
                ..HubSettings::default()
            },
        );

        for i in 0..12 {
            hub.route(InboundMessage::new("alice", format!("msg {}", i)))
                .await
                .unwrap();
        }

        let history = hub.history().await;
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].message, "msg 7");
        assert_eq!(history[4].message, "msg 11");
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_timestamps_non_decreasing() {
        let hub = degraded_hub();
        let mut last = None;
        for i in 0..50 {
            let report = hub
                .route(InboundMessage::new("alice", i.to_string()))
                .await
                .unwrap();
            if let Some(prev) = last {
                assert!(report.message.timestamp >= prev);
            }
            last = Some(report.message.timestamp);
        }
    }

    #[tokio::test]
    async fn test_bus_path_reaches_every_instance() {
        let bus = Arc::new(MemoryBus::new());

        let mut instances = Vec::new();
        for _ in 0..2 {
            let registry = Arc::new(ConnectionRegistry::new());
            let facade = BusFacade::connected(Arc::clone(&bus) as Arc<dyn MessageBus>, "chat");
            let feed = bus.subscribe("chat").await.unwrap();
            let bridge = FanoutBridge::spawn(feed, Arc::clone(&registry), facade.status());
            let hub = Hub::new(registry, StoreFacade::degraded(), facade, HubSettings::default());
            instances.push((hub, bridge));
        }

        let mut local = listen(&instances[0].0, "a");
        let mut remote = listen(&instances[1].0, "b");

        let report = instances[0]
            .0
            .route(InboundMessage::new("alice", "hello"))
            .await
            .unwrap();
        assert!(matches!(report.delivery, Delivery::Published));

        assert_eq!(live_message(&local.recv().await.unwrap()).message, "hello");
        assert_eq!(live_message(&remote.recv().await.unwrap()).message, "hello");

        // Published messages are never also broadcast locally
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(local.try_recv().is_err());
        assert!(remote.try_recv().is_err());

        for (_, bridge) in instances {
            bridge.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_degraded_bus_stays_on_instance() {
        let bus = Arc::new(MemoryBus::new());
        let mut other_instance = bus.subscribe("chat").await.unwrap();

        let hub = Hub::new(
            Arc::new(ConnectionRegistry::new()),
            StoreFacade::degraded(),
            BusFacade::degraded("chat"),
            HubSettings::default(),
        );
        let mut same_instance = listen(&hub, "b");

        hub.route(InboundMessage::new("alice", "local")).await.unwrap();
        assert_eq!(live_message(&same_instance.recv().await.unwrap()).message, "local");
        assert!(same_instance.try_recv().is_err());

        bus.close_topic("chat");
        assert!(other_instance.next().await.is_none());
    }

    struct RejectingBus;

    #[async_trait]
    impl MessageBus for RejectingBus {
        async fn ping(&self) -> Result<(), BusError> {
            Ok(())
        }

        async fn publish(&self, _topic: &str, _payload: &str) -> Result<(), BusError> {
            Err(BusError::Publish("READONLY".to_string()))
        }

        async fn subscribe(&self, _topic: &str) -> Result<PayloadStream, BusError> {
            Err(BusError::Subscribe("unsupported".to_string()))
        }

        fn backend_name(&self) -> &'static str {
            "rejecting"
        }
    }

    #[tokio::test]
    async fn test_publish_failure_falls_back_to_broadcast() {
        let hub = Hub::new(
            Arc::new(ConnectionRegistry::new()),
            StoreFacade::degraded(),
            BusFacade::connected(Arc::new(RejectingBus), "chat"),
            HubSettings::default(),
        );
        let mut rx = listen(&hub, "b");

        let report = hub.route(InboundMessage::new("alice", "hi")).await.unwrap();
        assert!(matches!(report.delivery, Delivery::Broadcast(_)));
        assert_eq!(live_message(&rx.recv().await.unwrap()).message, "hi");
        // A failed publish does not change the bus state
        assert_eq!(hub.snapshot().bus, BackendState::Connected);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let hub = degraded_hub();
        let _rx = listen(&hub, "a");

        let status = hub.snapshot();
        assert_eq!(status.store, BackendState::Degraded);
        assert_eq!(status.bus, BackendState::Degraded);
        assert_eq!(status.active_connections, 1);
        assert_eq!(
            serde_json::to_value(status).unwrap(),
            serde_json::json!({"store": "degraded", "bus": "degraded", "active_connections": 1})
        );
    }
}
