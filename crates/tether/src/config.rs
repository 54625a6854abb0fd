//! Client configuration.
//!
//! Everything is defaulted, so an empty file (or no file at all) yields a
//! client pointed at a local etcd with 5 second deadlines.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use tether_common::constants::{
    DEFAULT_DIAL_TIMEOUT_SECS, DEFAULT_ENDPOINT, DEFAULT_OP_TIMEOUT_SECS, ENV_PREFIX,
    KEEP_ALIVE_INITIAL_BACKOFF_MILLIS, KEEP_ALIVE_MAX_BACKOFF_MILLIS, KEEP_ALIVE_MAX_RETRIES,
    MIN_RENEW_INTERVAL_MILLIS,
};
use tether_common::{Result, TetherError};

/// Which store implementation backs the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// etcd v3 over gRPC (requires the `etcd` feature)
    #[default]
    Etcd,
    /// In-process store; nothing leaves the process
    Memory,
}

/// Connection handle configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Store backend
    pub backend: Backend,

    /// Store endpoints (host:port)
    pub endpoints: Vec<String>,

    /// Username for store authentication
    pub username: Option<String>,

    /// Password for store authentication
    pub password: Option<String>,

    /// Deadline for reaching an endpoint on connect
    pub dial_timeout_secs: u64,

    /// Default deadline for bounded operations
    pub op_timeout_secs: u64,

    /// Renewal behaviour for keep-alive streams
    pub keep_alive: KeepAliveConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            username: None,
            password: None,
            dial_timeout_secs: DEFAULT_DIAL_TIMEOUT_SECS,
            op_timeout_secs: DEFAULT_OP_TIMEOUT_SECS,
            keep_alive: KeepAliveConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from file, with `TETHER_*` environment overrides
    ///
    /// Nested keys use a double underscore, e.g. `TETHER_KEEP_ALIVE__MAX_RETRIES`.
    /// `TETHER_ENDPOINTS` takes a comma-separated list.
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let mut builder = config::Config::builder();

        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        } else {
            tracing::warn!(path = %config_path.display(), "Config file not found, using defaults");
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("endpoints")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TetherError::Config(format!("failed to load config: {}", e)))?;

        settings
            .try_deserialize()
            .map_err(|e| TetherError::Config(format!("failed to parse config: {}", e)))
    }

    /// Credentials, only when both halves are present
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

/// Keep-alive renewal configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Transient failures retried before the stream ends
    pub max_retries: u32,

    /// First retry backoff in milliseconds (doubles per attempt)
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,

    /// Floor for the renewal interval in milliseconds
    pub min_interval_ms: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            max_retries: KEEP_ALIVE_MAX_RETRIES,
            initial_backoff_ms: KEEP_ALIVE_INITIAL_BACKOFF_MILLIS,
            max_backoff_ms: KEEP_ALIVE_MAX_BACKOFF_MILLIS,
            min_interval_ms: MIN_RENEW_INTERVAL_MILLIS,
        }
    }
}

impl KeepAliveConfig {
    /// Time between renewals for a lease with the given remaining TTL: a third
    /// of the TTL, never below `min_interval_ms`
    pub fn renew_interval(&self, ttl_secs: i64) -> Duration {
        let third = Duration::from_millis((ttl_secs.max(0) as u64).saturating_mul(1000) / 3);
        third.max(Duration::from_millis(self.min_interval_ms))
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}
