//! Configuration loading and management.

use crate::db::outbox::RetryPolicy;
use crate::relay::RelayConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub relay: RelaySettings,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".fieldtask/tasks.db")
}

/// Outbox relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Worker id stamped on claimed outbox rows. Defaults to a
    /// process-scoped id.
    #[serde(default)]
    pub worker_id: Option<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    #[serde(default = "default_lease_ms")]
    pub lease_ms: i64,

    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Attempts before an event is parked as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: i64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: i64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            worker_id: None,
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            lease_ms: default_lease_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_batch_size() -> i64 {
    50
}

fn default_lease_ms() -> i64 {
    30_000
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> i32 {
    3
}

fn default_base_backoff_ms() -> i64 {
    1_000
}

fn default_max_backoff_ms() -> i64 {
    60_000
}

impl RelaySettings {
    /// Build the runtime relay configuration.
    pub fn to_relay_config(&self) -> RelayConfig {
        let defaults = RelayConfig::default();
        RelayConfig {
            worker_id: self.worker_id.clone().unwrap_or(defaults.worker_id),
            poll_interval_ms: self.poll_interval_ms,
            batch_size: self.batch_size,
            lease_ms: self.lease_ms,
            publish_timeout_ms: self.publish_timeout_ms,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_backoff_ms: self.base_backoff_ms,
                max_backoff_ms: self.max_backoff_ms,
            },
        }
    }
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the default location or fall back to
    /// defaults plus environment overrides.
    pub fn load_or_default() -> Self {
        if let Ok(config) = Self::load(".fieldtask/config.yaml") {
            return config;
        }

        let mut config = Self::default();

        if let Ok(db_path) = std::env::var("FIELDTASK_DB_PATH") {
            config.server.db_path = PathBuf::from(db_path);
        }

        if let Ok(interval) = std::env::var("FIELDTASK_POLL_INTERVAL_MS") {
            if let Ok(interval) = interval.parse() {
                config.relay.poll_interval_ms = interval;
            }
        }

        if let Ok(attempts) = std::env::var("FIELDTASK_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                config.relay.max_attempts = attempts;
            }
        }

        config
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.server.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
