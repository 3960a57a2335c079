//! # Relay Server
//!
//! Real-time chat relay with persisted history and cross-instance fanout.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! relay
//!
//! # Run with custom config
//! relay --config /path/to/relay.toml
//!
//! # Run with environment variables
//! RELAY_PORT=8080 RELAY_BUS__URL=redis://cache:6379 relay
//! ```

mod backends;
mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use relay_core::{BusStartup, ConnectionRegistry, FanoutBridge, Hub, StartupSupervisor};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=info,relay_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match config_path_arg() {
        Some(path) => config::Config::load_file(path)?,
        None => config::Config::load()?,
    };

    info!("Starting Relay server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(&config.host, config.metrics.port) {
            warn!(error = %e, "Metrics exporter not started");
        }
    }

    // Bring up backends; failures degrade rather than abort
    let supervisor = StartupSupervisor::new(config.retry_policy());
    let store = backends::start_store(&config.store, &supervisor).await;
    let BusStartup { facade: bus, feed } = backends::start_bus(&config.bus, &supervisor).await;

    info!(
        store = %supervisor.store_status().state(),
        bus = %supervisor.bus_status().state(),
        "Backends ready"
    );

    let registry = Arc::new(ConnectionRegistry::new());
    let bridge = feed.map(|feed| FanoutBridge::spawn(feed, Arc::clone(&registry), bus.status()));

    let hub = Arc::new(Hub::new(registry, store, bus, config.hub_settings()));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let state = Arc::new(handlers::AppState::new(hub, config));
    handlers::serve(listener, state, shutdown_signal()).await?;

    if let Some(bridge) = bridge {
        if !bridge.is_running() {
            warn!("Fanout bridge had already stopped; bus was degraded");
        }
        bridge.shutdown().await;
    }

    info!("Relay server stopped");
    Ok(())
}

/// Value of `--config PATH` or `--config=PATH`, if given.
fn config_path_arg() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
