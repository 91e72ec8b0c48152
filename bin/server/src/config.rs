//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables:
//! `DATABASE_URL`, `LISTEN_ADDR`, and `ENGINE__*` for scheduler tuning.

use cadence_scheduler::PollerConfig;
use cadence_workflow::runner::RetryPolicy;
use serde::Deserialize;
use std::time::Duration;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Address the HTTP server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Scheduler and retry tuning.
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Engine-related configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Seconds between scheduler polls.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    /// Maximum execution cursors claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Delay before the second attempt of a failed step, in seconds.
    #[serde(default = "default_retry_base_seconds")]
    pub retry_base_seconds: i64,

    /// Ceiling on retry delays, in seconds.
    #[serde(default = "default_retry_max_seconds")]
    pub retry_max_seconds: i64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_poll_interval_seconds() -> u64 {
    10
}

fn default_batch_size() -> u32 {
    25
}

fn default_retry_base_seconds() -> i64 {
    60
}

fn default_retry_max_seconds() -> i64 {
    3600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            batch_size: default_batch_size(),
            retry_base_seconds: default_retry_base_seconds(),
            retry_max_seconds: default_retry_max_seconds(),
        }
    }
}

impl EngineConfig {
    /// Poller settings derived from this configuration.
    #[must_use]
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(self.poll_interval_seconds),
            batch_size: self.batch_size,
        }
    }

    /// Retry backoff derived from this configuration.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_seconds: self.retry_base_seconds,
            max_seconds: self.retry_max_seconds,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
