//! Configuration.
//!
//! Loaded from a TOML file; every option has a default so an empty (or
//! missing) file is a valid configuration. Durations are integers in
//! milliseconds.

use std::fs::read_to_string;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{EngineConfig, RegistryConfig};

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on \"{0}\": {1}")]
    Io(String, #[source] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Run the coordinator on this address.
    #[serde(default = "Config::host")]
    pub host: String,
    /// Run the coordinator on this port.
    #[serde(default = "Config::port")]
    pub port: u16,
    /// Cap on concurrently executing tasks per query. Default: healthy
    /// worker count times tasks_per_worker.
    pub max_in_flight: Option<usize>,
    /// Concurrent tasks each worker is expected to absorb.
    #[serde(default = "Config::tasks_per_worker")]
    pub tasks_per_worker: usize,
    /// Partials combined per reduce task.
    #[serde(default = "Config::reduce_fanin")]
    pub reduce_fanin: usize,
    /// Deadline for a single map/reduce task.
    #[serde(default = "Config::task_timeout")]
    pub task_timeout: u64,
    /// Deadline for a whole query.
    #[serde(default = "Config::query_timeout")]
    pub query_timeout: u64,
    /// How long to wait for a worker before giving up with NoWorkers.
    #[serde(default = "Config::acquire_timeout")]
    pub acquire_timeout: u64,
    /// Attempts beyond the first for retryable task failures.
    #[serde(default = "Config::max_retries")]
    pub max_retries: usize,
    /// Workers without a heartbeat for this long are unhealthy.
    #[serde(default = "Config::worker_ttl")]
    pub worker_ttl: u64,
    /// Consecutive task failures before a worker is marked unhealthy.
    #[serde(default = "Config::failure_threshold")]
    pub failure_threshold: usize,
    /// How long to wait for in-flight tasks on cancellation.
    #[serde(default = "Config::cancel_grace")]
    pub cancel_grace: u64,
    /// Shard size for INSERT without ROWS PER SHARD.
    #[serde(default = "Config::default_rows_per_shard")]
    pub default_rows_per_shard: usize,
}

impl Config {
    fn host() -> String {
        "0.0.0.0".into()
    }

    fn port() -> u16 {
        8330
    }

    fn tasks_per_worker() -> usize {
        2
    }

    fn reduce_fanin() -> usize {
        8
    }

    fn task_timeout() -> u64 {
        30_000
    }

    fn query_timeout() -> u64 {
        300_000
    }

    fn acquire_timeout() -> u64 {
        10_000
    }

    fn max_retries() -> usize {
        3
    }

    fn worker_ttl() -> u64 {
        15_000
    }

    fn failure_threshold() -> usize {
        3
    }

    fn cancel_grace() -> u64 {
        5_000
    }

    fn default_rows_per_shard() -> usize {
        100_000
    }

    /// Load the configuration file from disk.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = read_to_string(path)
            .map_err(|err| Error::Io(path.display().to_string(), err))?;
        let config: Config = toml::from_str(&content)?;
        config.check()?;

        Ok(config)
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.reduce_fanin < 2 {
            return Err(Error::Invalid("reduce_fanin must be at least 2".into()));
        }
        if self.tasks_per_worker == 0 {
            return Err(Error::Invalid("tasks_per_worker must be positive".into()));
        }
        if self.default_rows_per_shard == 0 {
            return Err(Error::Invalid(
                "default_rows_per_shard must be positive".into(),
            ));
        }
        if let Some(0) = self.max_in_flight {
            return Err(Error::Invalid("max_in_flight must be positive".into()));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            acquire_timeout: Duration::from_millis(self.acquire_timeout),
            worker_ttl: Duration::from_millis(self.worker_ttl),
            failure_threshold: self.failure_threshold,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_in_flight: self.max_in_flight,
            tasks_per_worker: self.tasks_per_worker,
            reduce_fanin: self.reduce_fanin,
            task_timeout: Duration::from_millis(self.task_timeout),
            query_timeout: Duration::from_millis(self.query_timeout),
            max_retries: self.max_retries,
            cancel_grace: Duration::from_millis(self.cancel_grace),
        }
    }

    /// Workers heartbeat at a third of the TTL.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.worker_ttl / 3).max(Duration::from_millis(100))
    }
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("every option has a default")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tasks_per_worker, 2);
        assert_eq!(config.reduce_fanin, 8);
        assert_eq!(config.max_retries, 3);
        assert!(config.max_in_flight.is_none());
    }

    #[test]
    fn test_partial_file_overrides() {
        let config: Config = toml::from_str(
            r#"
            reduce_fanin = 2
            task_timeout = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.reduce_fanin, 2);
        assert_eq!(config.task_timeout, 1_000);
        assert_eq!(config.query_timeout, 300_000);
    }

    #[test]
    fn test_check_rejects_bad_values() {
        let mut config = Config::default();
        config.reduce_fanin = 1;
        assert!(config.check().is_err());

        let mut config = Config::default();
        config.max_in_flight = Some(0);
        assert!(config.check().is_err());
    }
}
