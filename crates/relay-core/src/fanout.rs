//! Fanout bridge: bus subscription in, local broadcasts out.
//!
//! One bridge runs per process while the bus is connected. Every payload
//! received on the topic, including the ones this instance published, is
//! broadcast to the local registry. Payloads are never published back.

use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::PayloadStream;
use crate::metrics;
use crate::registry::ConnectionRegistry;
use crate::supervisor::{BackendState, BackendStatus};

/// Counters for the lifetime of a bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    /// Payloads received from the bus.
    pub received: u64,
    /// Successful per-connection deliveries.
    pub delivered: u64,
    /// Connections pruned during bridged broadcasts.
    pub pruned: u64,
}

/// Handle to the background bridge task.
#[derive(Debug)]
pub struct FanoutBridge {
    handle: JoinHandle<FanoutStats>,
}

impl FanoutBridge {
    /// Start bridging `feed` into `registry`.
    ///
    /// When the feed fails or ends the bridge stops and marks the bus
    /// degraded, so senders switch to local broadcast. It does not
    /// resubscribe.
    #[must_use]
    pub fn spawn(
        feed: PayloadStream,
        registry: Arc<ConnectionRegistry>,
        bus_status: Arc<BackendStatus>,
    ) -> Self {
        let handle = tokio::spawn(run(feed, registry, bus_status));
        Self { handle }
    }

    /// Check if the bridge is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the bridge, dropping the subscription.
    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
        debug!("Fanout bridge shut down");
    }

    /// Wait for the bridge to stop on its own.
    ///
    /// Returns `None` if the task was cancelled or panicked.
    pub async fn join(self) -> Option<FanoutStats> {
        self.handle.await.ok()
    }
}

async fn run(
    mut feed: PayloadStream,
    registry: Arc<ConnectionRegistry>,
    bus_status: Arc<BackendStatus>,
) -> FanoutStats {
    info!("Fanout bridge started");
    let mut stats = FanoutStats::default();

    loop {
        match feed.next().await {
            Some(Ok(payload)) => {
                stats.received += 1;
                metrics::record_message(payload.len(), metrics::OUTBOUND);

                let report = registry.broadcast(Arc::from(payload));
                stats.delivered += report.delivered as u64;
                stats.pruned += report.pruned.len() as u64;
            }
            Some(Err(e)) => {
                error!(error = %e, "Bus subscription failed, stopping fanout bridge");
                metrics::record_error("bus_subscription");
                break;
            }
            None => {
                warn!("Bus subscription ended, stopping fanout bridge");
                break;
            }
        }
    }

    bus_status.set(BackendState::Degraded);
    info!(
        received = stats.received,
        delivered = stats.delivered,
        "Fanout bridge stopped"
    );
    stats
}
