//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use crate::stream::{ConsumerConfig, IteratorInit};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Sleep between shard polls
    pub stream_poll_interval_ms: u64,

    /// Max records per stream fetch
    pub stream_batch_limit: usize,

    /// Number of logical change-stream shards
    pub stream_shard_count: u32,

    /// Where a shard cursor starts on open
    pub iterator_init: IteratorInit,

    /// Retries on event log append conflicts
    pub command_retry_max: u32,

    /// Per external call deadline
    pub call_timeout_ms: u64,

    /// How often the consumer re-describes the stream for shard changes
    pub shard_rediscovery_interval_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = parse_var("DATABASE_MAX_CONNECTIONS", "10")?;
        let stream_poll_interval_ms = parse_var("STREAM_POLL_INTERVAL_MS", "1000")?;
        let stream_batch_limit = parse_var("STREAM_BATCH_LIMIT", "100")?;
        let stream_shard_count = parse_var("STREAM_SHARD_COUNT", "4")?;
        let command_retry_max = parse_var("COMMAND_RETRY_MAX", "3")?;
        let call_timeout_ms = parse_var("CALL_TIMEOUT_MS", "5000")?;
        let shard_rediscovery_interval_ms = parse_var("SHARD_REDISCOVERY_INTERVAL_MS", "30000")?;

        let iterator_init = env::var("ITERATOR_INIT")
            .unwrap_or_else(|_| "after_checkpoint".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("ITERATOR_INIT"))?;

        Ok(Self {
            database_url,
            database_max_connections,
            stream_poll_interval_ms,
            stream_batch_limit,
            stream_shard_count,
            iterator_init,
            command_retry_max,
            call_timeout_ms,
            shard_rediscovery_interval_ms,
        })
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// The stream consumer's tuning block derived from this configuration.
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            poll_interval: Duration::from_millis(self.stream_poll_interval_ms),
            batch_limit: self.stream_batch_limit,
            iterator_init: self.iterator_init,
            call_timeout: self.call_timeout(),
            rediscovery_interval: Duration::from_millis(self.shard_rediscovery_interval_ms),
            ..ConsumerConfig::default()
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
