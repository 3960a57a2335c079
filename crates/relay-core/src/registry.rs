//! Connection registry for Relay.
//!
//! The registry owns the live set of client connections. Each entry is the
//! sending half of a bounded per-connection queue; the session that owns the
//! connection drains the queue onto the socket. Broadcasting only ever
//! enqueues, so one slow client can never hold up delivery to the others.

use dashmap::DashMap;
use relay_transport::ConnectionId;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

/// An encoded frame, shared between every queue it is delivered to.
pub type Payload = Arc<str>;

/// Outcome of a single broadcast pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections in the snapshot the pass ran over.
    pub attempted: usize,
    /// Connections whose queue accepted the payload.
    pub delivered: usize,
    /// Connections removed after the pass because delivery failed.
    pub pruned: Vec<ConnectionId>,
}

impl BroadcastReport {
    /// Number of connections delivery failed for.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.attempted - self.delivered
    }
}

/// The live set of client connections.
///
/// Built once at startup and shared by handle with every session and with
/// the fanout bridge.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, mpsc::Sender<Payload>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to the live set.
    ///
    /// Registering an ID that is already present replaces its queue.
    pub fn register(&self, id: ConnectionId, sender: mpsc::Sender<Payload>) {
        debug!(connection = %id, "Registered connection");
        if self.connections.insert(id.clone(), sender).is_some() {
            warn!(connection = %id, "Replaced an existing registration");
        }
    }

    /// Remove a connection from the live set.
    ///
    /// Returns `true` if it was present. Removing an absent connection is a
    /// no-op.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.remove(id).is_some();
        if removed {
            debug!(connection = %id, "Unregistered connection");
        }
        removed
    }

    /// Deliver a payload to every registered connection.
    ///
    /// The pass runs over a snapshot of the live set. Connections whose queue
    /// is full or closed are collected and removed once the pass is done.
    /// A connection registered while the pass runs may or may not see it.
    pub fn broadcast(&self, payload: Payload) -> BroadcastReport {
        let snapshot: Vec<(ConnectionId, mpsc::Sender<Payload>)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, sender) in &snapshot {
            match sender.try_send(Arc::clone(&payload)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection = %id, "Outbound queue full, dropping connection");
                    failed.push((id, sender));
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection = %id, "Outbound queue closed");
                    failed.push((id, sender));
                }
            }
        }

        // Only remove the exact queue that failed: the ID may have been
        // re-registered with a fresh one in the meantime.
        let pruned = failed
            .into_iter()
            .filter(|(id, sender)| {
                self.connections
                    .remove_if(*id, |_, current| current.same_channel(sender))
                    .is_some()
            })
            .map(|(id, _)| id.clone())
            .collect();

        let report = BroadcastReport {
            attempted: snapshot.len(),
            delivered,
            pruned,
        };
        trace!(
            attempted = report.attempted,
            delivered = report.delivered,
            "Broadcast"
        );
        report
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no live connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> Payload {
        Arc::from(text)
    }

    #[test]
    fn test_register_unregister_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = ConnectionId::new("conn-1");

        registry.register(id.clone(), tx);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&id));

        assert!(registry.unregister(&id));
        assert!(!registry.unregister(&id));
        assert_eq!(registry.len(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_same_id_replaces() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        registry.register("conn-1".into(), tx1);
        registry.register("conn-1".into(), tx2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_delivers_to_all() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        registry.register("conn-1".into(), tx1);
        registry.register("conn-2".into(), tx2);

        let report = registry.broadcast(payload("hello"));
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);
        assert!(report.pruned.is_empty());

        assert_eq!(&*rx1.try_recv().unwrap(), "hello");
        assert_eq!(&*rx2.try_recv().unwrap(), "hello");
    }

    #[test]
    fn test_broadcast_on_empty_registry() {
        let registry = ConnectionRegistry::new();
        let report = registry.broadcast(payload("nobody"));
        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn test_broadcast_isolates_failed_connection() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        for i in 0..5 {
            let (tx, rx) = mpsc::channel(4);
            registry.register(format!("conn-{}", i).into(), tx);
            receivers.push(rx);
        }

        // conn-2 goes away without unregistering
        drop(receivers.remove(2));

        let report = registry.broadcast(payload("hi"));
        assert_eq!(report.attempted, 5);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.pruned, vec![ConnectionId::new("conn-2")]);
        assert_eq!(registry.len(), 4);

        for rx in &mut receivers {
            assert_eq!(&*rx.try_recv().unwrap(), "hi");
        }
    }

    #[test]
    fn test_broadcast_prunes_full_queue() {
        let registry = ConnectionRegistry::new();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        registry.register("slow".into(), slow_tx);
        registry.register("fast".into(), fast_tx);

        let first = registry.broadcast(payload("one"));
        assert!(first.pruned.is_empty());

        let second = registry.broadcast(payload("two"));
        assert_eq!(second.pruned, vec![ConnectionId::new("slow")]);
        assert!(!registry.contains(&"slow".into()));

        assert_eq!(&*fast_rx.try_recv().unwrap(), "one");
        assert_eq!(&*fast_rx.try_recv().unwrap(), "two");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_broadcast_unregister() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();

        for i in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let id = ConnectionId::new(format!("conn-{}", i));
                let (tx, mut rx) = mpsc::channel(64);
                registry.register(id.clone(), tx);
                registry.broadcast(payload("ping"));
                while rx.try_recv().is_ok() {}
                registry.unregister(&id);
                registry.unregister(&id);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
        assert!(registry.is_empty());
    }
}
