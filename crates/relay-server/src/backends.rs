//! Backend selection and startup.

use relay_core::{
    BusError, BusStartup, MemoryBus, MemoryStore, MessageBus, MessageStore, RedisBus,
    SqliteStore, StartupSupervisor, StoreError, StoreFacade,
};
use std::sync::Arc;
use tracing::info;

use crate::config::{BusBackend, BusConfig, StoreBackend, StoreConfig};

/// Bring up the configured store, retrying per the supervisor's policy.
pub async fn start_store(config: &StoreConfig, supervisor: &StartupSupervisor) -> StoreFacade {
    match config.backend {
        StoreBackend::Sqlite => {
            info!(path = %config.path, "Connecting to SQLite store");
            supervisor
                .start_store(|| {
                    let path = config.path.clone();
                    async move {
                        let store = SqliteStore::open(path).await?;
                        Ok::<_, StoreError>(Arc::new(store) as Arc<dyn MessageStore>)
                    }
                })
                .await
        }
        StoreBackend::Memory => {
            info!("Using in-memory store");
            supervisor
                .start_store(|| async {
                    Ok::<_, StoreError>(Arc::new(MemoryStore::new()) as Arc<dyn MessageStore>)
                })
                .await
        }
        StoreBackend::Disabled => supervisor.disable_store(),
    }
}

/// Bring up the configured bus and its subscription.
pub async fn start_bus(config: &BusConfig, supervisor: &StartupSupervisor) -> BusStartup {
    match config.backend {
        BusBackend::Redis => {
            info!(url = %config.url, topic = %config.topic, "Connecting to Redis bus");
            supervisor
                .start_bus(&config.topic, || {
                    let url = config.url.clone();
                    async move {
                        let bus = RedisBus::connect(&url).await?;
                        Ok::<_, BusError>(Arc::new(bus) as Arc<dyn MessageBus>)
                    }
                })
                .await
        }
        BusBackend::Memory => {
            info!(topic = %config.topic, "Using in-memory bus");
            supervisor
                .start_bus(&config.topic, || async {
                    Ok::<_, BusError>(Arc::new(MemoryBus::new()) as Arc<dyn MessageBus>)
                })
                .await
        }
        BusBackend::Disabled => BusStartup {
            facade: supervisor.disable_bus(&config.topic),
            feed: None,
        },
    }
}
