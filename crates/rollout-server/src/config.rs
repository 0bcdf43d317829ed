//! Configuration for the workspace engine server
//!
//! Settings come from environment variables; unparsable values are logged
//! and replaced by their default.

use rollout_engine::EngineConfig;
use rollout_monitoring::{LogFormat, MonitoringConfig};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ServerError, ServerResult};
use crate::retry::RetryPolicy;

/// Event log backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    /// In-process log, for tests and single-node runs
    Memory,
    /// Kafka (requires the `kafka` feature)
    Kafka,
}

impl FromStr for LogBackend {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(LogBackend::Memory),
            "kafka" => Ok(LogBackend::Kafka),
            other => Err(ServerError::ConfigError(format!("Unknown LOG_BACKEND '{}'", other))),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Broker list for the Kafka backend
    #[serde(default = "default_brokers")]
    pub log_brokers: String,

    /// Event topic
    #[serde(default = "default_topic")]
    pub log_topic: String,

    /// Consumer group
    #[serde(default = "default_group_id")]
    pub log_group_id: String,

    /// Partition count
    #[serde(default = "default_num_partitions")]
    pub log_num_partitions: i32,

    /// Log backend
    #[serde(default = "default_backend")]
    pub log_backend: LogBackend,

    /// Partitions this instance consumes; empty means all
    #[serde(default)]
    pub owned_partitions: Vec<i32>,

    /// Snapshot blob storage URL
    #[serde(default = "default_snapshot_url")]
    pub snapshot_storage_url: String,

    /// Database used for cold-start bootstrap and the snapshot registry
    #[serde(default)]
    pub database_url: Option<String>,

    /// Log filter
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Scheduler ticker period in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Engine settings handed to every workspace
    #[serde(default)]
    pub engine: EngineConfig,

    /// Attempts for transient I/O
    #[serde(default = "default_io_retry_attempts")]
    pub io_retry_attempts: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_io_retry_base_delay_ms")]
    pub io_retry_base_delay_ms: u64,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_topic() -> String {
    "workspace-events".to_string()
}

fn default_group_id() -> String {
    "workspace-engine".to_string()
}

fn default_num_partitions() -> i32 {
    1
}

fn default_backend() -> LogBackend {
    LogBackend::Memory
}

fn default_snapshot_url() -> String {
    "memory://".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_io_retry_attempts() -> u32 {
    5
}

fn default_io_retry_base_delay_ms() -> u64 {
    100
}

fn parse_or_warn<T: FromStr>(name: &str, raw: &str, current: T) -> T {
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!("Invalid {} value: {}", name, raw);
            current
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn load() -> ServerResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> ServerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(brokers) = lookup("LOG_BROKERS") {
            config.log_brokers = brokers;
        }
        if let Some(topic) = lookup("LOG_TOPIC") {
            config.log_topic = topic;
        }
        if let Some(group_id) = lookup("LOG_GROUP_ID") {
            config.log_group_id = group_id;
        }
        if let Some(n) = lookup("LOG_NUM_PARTITIONS") {
            config.log_num_partitions = parse_or_warn("LOG_NUM_PARTITIONS", &n, config.log_num_partitions);
        }
        if let Some(backend) = lookup("LOG_BACKEND") {
            config.log_backend = backend.parse()?;
        }
        if let Some(owned) = lookup("OWNED_PARTITIONS") {
            config.owned_partitions = owned
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| {
                    p.parse::<i32>()
                        .map_err(|_| ServerError::ConfigError(format!("Invalid partition in OWNED_PARTITIONS: {}", p)))
                })
                .collect::<ServerResult<Vec<_>>>()?;
        }
        if let Some(url) = lookup("SNAPSHOT_STORAGE_URL") {
            config.snapshot_storage_url = url;
        }
        if let Some(url) = lookup("DATABASE_URL").filter(|url| !url.is_empty()) {
            config.database_url = Some(url);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            config.log_format = parse_or_warn("LOG_FORMAT", &format, config.log_format);
        }
        if let Some(ms) = lookup("TICK_INTERVAL_MS") {
            config.tick_interval_ms = parse_or_warn("TICK_INTERVAL_MS", &ms, config.tick_interval_ms);
        }
        if let Some(budget) = lookup("RECONCILE_BUDGET") {
            config.engine.reconcile_budget = parse_or_warn("RECONCILE_BUDGET", &budget, config.engine.reconcile_budget);
        }
        if let Some(capacity) = lookup("MATCH_CACHE_CAPACITY") {
            config.engine.match_cache_capacity =
                parse_or_warn("MATCH_CACHE_CAPACITY", &capacity, config.engine.match_cache_capacity);
        }
        if let Some(cancel) = lookup("CANCEL_PENDING_JOBS_ON_TARGET_REMOVAL") {
            match parse_bool(&cancel) {
                Some(value) => config.engine.cancel_pending_jobs_on_target_removal = value,
                None => warn!("Invalid CANCEL_PENDING_JOBS_ON_TARGET_REMOVAL value: {}", cancel),
            }
        }
        if let Some(attempts) = lookup("IO_RETRY_ATTEMPTS") {
            config.io_retry_attempts = parse_or_warn("IO_RETRY_ATTEMPTS", &attempts, config.io_retry_attempts);
        }
        if let Some(ms) = lookup("IO_RETRY_BASE_DELAY_MS") {
            config.io_retry_base_delay_ms = parse_or_warn("IO_RETRY_BASE_DELAY_MS", &ms, config.io_retry_base_delay_ms);
        }

        config.validate()?;
        info!(
            backend = ?config.log_backend,
            partitions = config.log_num_partitions,
            owned = ?config.owned_partitions,
            snapshot_storage = %config.snapshot_storage_url,
            "Loaded server configuration"
        );
        Ok(config)
    }

    /// Check the configuration for values the server cannot run with
    pub fn validate(&self) -> ServerResult<()> {
        if self.log_num_partitions <= 0 {
            return Err(ServerError::ConfigError("LOG_NUM_PARTITIONS must be greater than zero".to_string()));
        }
        if let Some(p) = self.owned_partitions.iter().find(|p| **p < 0 || **p >= self.log_num_partitions) {
            return Err(ServerError::ConfigError(format!(
                "Owned partition {} is outside 0..{}",
                p, self.log_num_partitions
            )));
        }
        if self.log_topic.is_empty() {
            return Err(ServerError::ConfigError("LOG_TOPIC must not be empty".to_string()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ServerError::ConfigError("TICK_INTERVAL_MS must be greater than zero".to_string()));
        }
        if self.engine.reconcile_budget == 0 {
            return Err(ServerError::ConfigError("RECONCILE_BUDGET must be greater than zero".to_string()));
        }

        if self.log_backend == LogBackend::Memory && self.log_num_partitions > 1 && self.owned_partitions.len() == 1 {
            warn!("In-memory log with a single owned partition; other partitions are never consumed");
        }
        if self.snapshot_storage_url.starts_with("memory://") {
            warn!("Snapshots are kept in memory and lost on restart");
        }
        if self.database_url.is_none() {
            warn!("No DATABASE_URL provided - workspaces without a snapshot start empty");
        }
        Ok(())
    }

    /// Partitions this instance consumes
    pub fn partitions(&self) -> Vec<i32> {
        if self.owned_partitions.is_empty() {
            (0..self.log_num_partitions).collect()
        } else {
            let mut owned = self.owned_partitions.clone();
            owned.sort_unstable();
            owned.dedup();
            owned
        }
    }

    /// Scheduler ticker period
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Backoff for transient I/O
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.io_retry_attempts, Duration::from_millis(self.io_retry_base_delay_ms))
    }

    /// Logging settings
    pub fn monitoring(&self) -> MonitoringConfig {
        MonitoringConfig {
            service_name: "workspace-engine".to_string(),
            log_filter: self.log_level.clone(),
            log_format: self.log_format,
            enable_metrics: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_brokers: default_brokers(),
            log_topic: default_topic(),
            log_group_id: default_group_id(),
            log_num_partitions: default_num_partitions(),
            log_backend: default_backend(),
            owned_partitions: Vec::new(),
            snapshot_storage_url: default_snapshot_url(),
            database_url: None,
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            tick_interval_ms: default_tick_interval_ms(),
            engine: EngineConfig::default(),
            io_retry_attempts: default_io_retry_attempts(),
            io_retry_base_delay_ms: default_io_retry_base_delay_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> ServerResult<ServerConfig> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.log_topic, "workspace-events");
        assert_eq!(config.log_num_partitions, 1);
        assert_eq!(config.log_backend, LogBackend::Memory);
        assert_eq!(config.partitions(), vec![0]);
        assert_eq!(config.engine.reconcile_budget, 16);
        assert!(!config.engine.cancel_pending_jobs_on_target_removal);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("LOG_NUM_PARTITIONS", "8"),
            ("OWNED_PARTITIONS", "5, 1,5"),
            ("SNAPSHOT_STORAGE_URL", "file:///var/lib/snapshots"),
            ("LOG_FORMAT", "json"),
            ("CANCEL_PENDING_JOBS_ON_TARGET_REMOVAL", "true"),
            ("RECONCILE_BUDGET", "4"),
        ])
        .unwrap();
        assert_eq!(config.partitions(), vec![1, 5]);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.engine.cancel_pending_jobs_on_target_removal);
        assert_eq!(config.engine.reconcile_budget, 4);
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("LOG_NUM_PARTITIONS", "0")]).is_err());
        assert!(load(&[("LOG_NUM_PARTITIONS", "2"), ("OWNED_PARTITIONS", "3")]).is_err());
        assert!(load(&[("LOG_BACKEND", "pulsar")]).is_err());
        assert!(load(&[("OWNED_PARTITIONS", "x")]).is_err());
        // Unparsable numbers fall back to the default
        assert_eq!(load(&[("TICK_INTERVAL_MS", "soon")]).unwrap().tick_interval_ms, 1000);
    }
}
