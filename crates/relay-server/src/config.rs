//! Server configuration.
//!
//! Configuration is layered, later layers winning:
//! - Built-in defaults (`RELAY_HOST` / `RELAY_PORT` seed host and port)
//! - The first TOML file found among the default paths
//! - Environment variables (`RELAY_*`, `__` between nested keys, e.g.
//!   `RELAY_BUS__URL=redis://cache:6379`)

use anyhow::{Context, Result};
use relay_core::{HubSettings, RetryPolicy};
use relay_protocol::MAX_INBOUND_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Files tried in order; the first one that exists is used.
const CONFIG_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// A configuration value outside its allowed range.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting that must be positive is zero.
    #[error("{0} must be at least 1")]
    Zero(&'static str),

    /// A setting is outside its allowed range.
    #[error("Invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path of the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// History replay.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Message store backend.
    #[serde(default)]
    pub store: StoreConfig,

    /// Pub/sub bus backend.
    #[serde(default)]
    pub bus: BusConfig,

    /// Backend connect retries at startup.
    #[serde(default)]
    pub startup: StartupConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// History replay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Messages sent to a new connection.
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

/// Which store backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
    Disabled,
}

/// Message store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind.
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// Database file for the SQLite backend.
    #[serde(default = "default_store_path")]
    pub path: String,
}

/// Which bus backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    Redis,
    Memory,
    Disabled,
}

/// Pub/sub bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Backend kind.
    #[serde(default = "default_bus_backend")]
    pub backend: BusBackend,

    /// Server URL for the Redis backend.
    #[serde(default = "default_bus_url")]
    pub url: String,

    /// Topic shared by every instance.
    #[serde(default = "default_bus_topic")]
    pub topic: String,
}

/// Startup retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    /// Connect attempts per backend.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Delay multiplier per failed attempt (1.0 keeps it fixed).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Per-connection outbound queue length.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/".to_string()
}

fn default_history_limit() -> usize {
    100
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_store_path() -> String {
    "relay.db".to_string()
}

fn default_bus_backend() -> BusBackend {
    BusBackend::Redis
}

fn default_bus_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_bus_topic() -> String {
    "chat".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2_000 // 2 seconds
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_max_message_size() -> usize {
    MAX_INBOUND_SIZE
}

fn default_outbound_queue() -> usize {
    256
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_ws_path(),
            history: HistoryConfig::default(),
            store: StoreConfig::default(),
            bus: BusConfig::default(),
            startup: StartupConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            limit: default_history_limit(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: default_bus_backend(),
            url: default_bus_url(),
            topic: default_bus_topic(),
        }
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, the first config file found, and
    /// the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// the merged configuration is invalid.
    pub fn load() -> Result<Self> {
        Self::layered(Self::find_file().as_deref(), None)
    }

    /// Load configuration from an explicit file, then the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// merged configuration is invalid.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        Self::layered(Some(path), None)
    }

    fn find_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Merge the layers. `env` replaces the process environment when given.
    fn layered(file: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&Config::default()).context("Failed to seed defaults")?,
        );

        if let Some(path) = file {
            tracing::info!("Loading configuration from {}", path.display());
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history.limit == 0 {
            return Err(ConfigError::Zero("history.limit"));
        }
        if self.startup.max_attempts == 0 {
            return Err(ConfigError::Zero("startup.max_attempts"));
        }
        if self.limits.outbound_queue == 0 {
            return Err(ConfigError::Zero("limits.outbound_queue"));
        }
        if self.limits.max_message_size == 0 {
            return Err(ConfigError::Zero("limits.max_message_size"));
        }
        if !self.startup.backoff_factor.is_finite() || self.startup.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid {
                field: "startup.backoff_factor",
                reason: format!("{} is not a finite value >= 1.0", self.startup.backoff_factor),
            });
        }
        if !self.websocket_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "websocket_path",
                reason: "must start with '/'".to_string(),
            });
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Retry schedule for the startup supervisor.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.startup.max_attempts,
            delay: Duration::from_millis(self.startup.retry_delay_ms),
            backoff_factor: self.startup.backoff_factor,
        }
    }

    /// Settings for the hub.
    #[must_use]
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            history_limit: self.history.limit,
            outbound_queue: self.limits.outbound_queue,
            max_message_size: self.limits.max_message_size,
        }
    }
}
