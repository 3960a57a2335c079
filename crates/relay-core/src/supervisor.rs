//! Startup supervision for the store and bus backends.
//!
//! Each backend runs its own small state machine:
//!
//! ```text
//! Connecting ──(connect + probe ok)──▶ Connected
//!     │
//!     └──(attempts exhausted)──▶ Degraded
//! ```
//!
//! `Degraded` is terminal for the life of the process. The two backends are
//! independent; any combination of outcomes yields a running server.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::bus::{BusError, BusFacade, MessageBus, PayloadStream};
use crate::store::{MessageStore, StoreError, StoreFacade};

/// Upper bound on a single backend call, including connect attempts.
pub const BACKEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest delay between two connect attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Lifecycle state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Connecting,
    Connected,
    Degraded,
}

impl BackendState {
    /// Lowercase name, as reported by the health endpoint.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Connecting => "connecting",
            BackendState::Connected => "connected",
            BackendState::Degraded => "degraded",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => BackendState::Connecting,
            1 => BackendState::Connected,
            _ => BackendState::Degraded,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            BackendState::Connecting => 0,
            BackendState::Connected => 1,
            BackendState::Degraded => 2,
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, queryable state of one backend.
#[derive(Debug)]
pub struct BackendStatus {
    name: &'static str,
    state: AtomicU8,
}

impl BackendStatus {
    /// Create a status in the given state.
    #[must_use]
    pub fn new(name: &'static str, state: BackendState) -> Self {
        Self {
            name,
            state: AtomicU8::new(state.to_u8()),
        }
    }

    /// Backend name (`store` or `bus`).
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BackendState {
        BackendState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: BackendState) {
        let previous = BackendState::from_u8(self.state.swap(state.to_u8(), Ordering::AcqRel));
        if previous != state {
            info!(backend = self.name, from = %previous, to = %state, "Backend state changed");
        }
    }
}

/// Bounded retry schedule for connect attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
            backoff_factor: 1.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let secs = self.delay.as_secs_f64() * factor;
        if secs.is_finite() && secs < MAX_RETRY_DELAY.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            MAX_RETRY_DELAY
        }
    }
}

/// What [`StartupSupervisor::start_bus`] hands back.
pub struct BusStartup {
    /// Facade for publishing.
    pub facade: BusFacade,
    /// The live subscription, present only when the bus connected.
    pub feed: Option<PayloadStream>,
}

/// Runs the startup sequence for both backends.
#[derive(Debug)]
pub struct StartupSupervisor {
    policy: RetryPolicy,
    store: Arc<BackendStatus>,
    bus: Arc<BackendStatus>,
}

impl StartupSupervisor {
    /// Create a supervisor; both backends start out `Connecting`.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            store: Arc::new(BackendStatus::new("store", BackendState::Connecting)),
            bus: Arc::new(BackendStatus::new("bus", BackendState::Connecting)),
        }
    }

    /// Store state.
    #[must_use]
    pub fn store_status(&self) -> Arc<BackendStatus> {
        Arc::clone(&self.store)
    }

    /// Bus state.
    #[must_use]
    pub fn bus_status(&self) -> Arc<BackendStatus> {
        Arc::clone(&self.bus)
    }

    /// Connect the store with retries, probing liveness on every attempt.
    pub async fn start_store<F, Fut>(&self, mut connect: F) -> StoreFacade
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Arc<dyn MessageStore>, StoreError>>,
    {
        let backend = connect_with_retry(&self.store, &self.policy, || {
            let attempt = connect();
            async move {
                let store = attempt.await?;
                store.ping().await?;
                Ok::<_, StoreError>(store)
            }
        })
        .await;

        StoreFacade::from_parts(backend, Arc::clone(&self.store))
    }

    /// Mark the store degraded without trying to connect.
    #[must_use]
    pub fn disable_store(&self) -> StoreFacade {
        info!("Store disabled by configuration");
        self.store.set(BackendState::Degraded);
        StoreFacade::from_parts(None, Arc::clone(&self.store))
    }

    /// Connect the bus with retries. An attempt succeeds once the backend
    /// answers a ping and the subscription to `topic` is open.
    pub async fn start_bus<F, Fut>(&self, topic: &str, mut connect: F) -> BusStartup
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Arc<dyn MessageBus>, BusError>>,
    {
        let connected = connect_with_retry(&self.bus, &self.policy, || {
            let attempt = connect();
            let topic = topic.to_string();
            async move {
                let bus = attempt.await?;
                bus.ping().await?;
                let feed = bus.subscribe(&topic).await?;
                Ok::<_, BusError>((bus, feed))
            }
        })
        .await;

        match connected {
            Some((bus, feed)) => BusStartup {
                facade: BusFacade::from_parts(Some(bus), Arc::clone(&self.bus), topic),
                feed: Some(feed),
            },
            None => BusStartup {
                facade: BusFacade::from_parts(None, Arc::clone(&self.bus), topic),
                feed: None,
            },
        }
    }

    /// Mark the bus degraded without trying to connect.
    #[must_use]
    pub fn disable_bus(&self, topic: &str) -> BusFacade {
        info!("Bus disabled by configuration");
        self.bus.set(BackendState::Degraded);
        BusFacade::from_parts(None, Arc::clone(&self.bus), topic)
    }
}

async fn connect_with_retry<T, E, F, Fut>(
    status: &BackendStatus,
    policy: &RetryPolicy,
    mut attempt_fn: F,
) -> Option<T>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    status.set(BackendState::Connecting);
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let outcome = tokio::time::timeout(BACKEND_TIMEOUT, attempt_fn()).await;

        match outcome {
            Ok(Ok(value)) => {
                info!(backend = status.name(), attempt, "Backend connected");
                status.set(BackendState::Connected);
                return Some(value);
            }
            Ok(Err(e)) => {
                warn!(
                    backend = status.name(),
                    attempt,
                    max_attempts,
                    error = %e,
                    "Backend connect attempt failed"
                );
            }
            Err(_) => {
                warn!(
                    backend = status.name(),
                    attempt,
                    max_attempts,
                    timeout = ?BACKEND_TIMEOUT,
                    "Backend connect attempt timed out"
                );
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }
    }

    warn!(
        backend = status.name(),
        "Backend unavailable after {} attempts, continuing degraded", max_attempts
    );
    status.set(BackendState::Degraded);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(2),
            backoff_factor: 1.0,
        }
    }

    #[test]
    fn test_delay_for() {
        let fixed = policy();
        assert_eq!(fixed.delay_for(1), Duration::from_secs(2));
        assert_eq!(fixed.delay_for(3), Duration::from_secs(2));

        let doubling = RetryPolicy {
            backoff_factor: 2.0,
            ..policy()
        };
        assert_eq!(doubling.delay_for(1), Duration::from_secs(2));
        assert_eq!(doubling.delay_for(2), Duration::from_secs(4));
        assert_eq!(doubling.delay_for(3), Duration::from_secs(8));
        assert_eq!(doubling.delay_for(50), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_backend_state_wire_names() {
        assert_eq!(BackendState::Degraded.to_string(), "degraded");
        assert_eq!(
            serde_json::to_value(BackendState::Connected).unwrap(),
            serde_json::json!("connected")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_connects_after_retries() {
        let supervisor = StartupSupervisor::new(policy());
        assert_eq!(supervisor.store_status().state(), BackendState::Connecting);

        let attempts = AtomicU32::new(0);
        let started = Instant::now();
        let facade = supervisor
            .start_store(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(StoreError::Database("refused".to_string()))
                    } else {
                        Ok::<_, StoreError>(Arc::new(MemoryStore::new()) as Arc<dyn MessageStore>)
                    }
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        assert!(facade.is_available());
        assert_eq!(supervisor.store_status().state(), BackendState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_degrades_after_bound() {
        let supervisor = StartupSupervisor::new(policy());
        let attempts = AtomicU32::new(0);

        let facade = supervisor
            .start_store(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<Arc<dyn MessageStore>, _>(StoreError::Unavailable) }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!facade.is_available());
        assert_eq!(facade.state(), BackendState::Degraded);
        assert!(facade.recent_ordered(100).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_connect_times_out() {
        let supervisor = StartupSupervisor::new(RetryPolicy {
            max_attempts: 2,
            ..policy()
        });
        let started = Instant::now();

        let facade = supervisor
            .start_store(|| std::future::pending::<Result<Arc<dyn MessageStore>, StoreError>>())
            .await;

        assert_eq!(facade.state(), BackendState::Degraded);
        assert_eq!(started.elapsed(), BACKEND_TIMEOUT * 2 + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backends_are_independent() {
        let supervisor = StartupSupervisor::new(policy());

        let store = supervisor
            .start_store(|| async { Err::<Arc<dyn MessageStore>, _>(StoreError::Unavailable) })
            .await;
        let bus = supervisor
            .start_bus("chat", || async {
                Ok::<_, BusError>(Arc::new(MemoryBus::new()) as Arc<dyn MessageBus>)
            })
            .await;

        assert_eq!(store.state(), BackendState::Degraded);
        assert_eq!(bus.facade.state(), BackendState::Connected);
        assert!(bus.feed.is_some());
        assert_eq!(supervisor.bus_status().state(), BackendState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_degraded_has_no_feed() {
        let supervisor = StartupSupervisor::new(policy());
        let bus = supervisor
            .start_bus("chat", || async {
                Err::<Arc<dyn MessageBus>, _>(BusError::Connection("refused".to_string()))
            })
            .await;

        assert!(bus.feed.is_none());
        assert!(!bus.facade.is_available());
        assert_eq!(bus.facade.state(), BackendState::Degraded);
    }

    #[test]
    fn test_disabled_backends() {
        let supervisor = StartupSupervisor::new(policy());
        let store = supervisor.disable_store();
        let bus = supervisor.disable_bus("chat");

        assert_eq!(store.state(), BackendState::Degraded);
        assert_eq!(bus.state(), BackendState::Degraded);
        assert_eq!(supervisor.store_status().state(), BackendState::Degraded);
    }
}
