//! Monitoring for the rollout workspace engine.
//!
//! Logging goes through `tracing`; [`init_logging`] installs the process
//! subscriber. Counters go through the `metrics` facade via
//! [`EngineMetrics`]; without an installed recorder they are no-ops.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

pub mod logging;
pub mod metrics;

pub use crate::logging::{init_logging, LogExt};
pub use crate::metrics::EngineMetrics;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, multi-line
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Unrecognised log format name
#[derive(Debug, Error)]
#[error("Unknown log format '{0}', expected 'pretty' or 'json'")]
pub struct UnknownLogFormat(pub String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(UnknownLogFormat(other.to_string())),
        }
    }
}

/// Configuration for logging and metrics
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Filter directive (e.g. "info,rollout_engine=debug"); `RUST_LOG` wins
    pub log_filter: String,
    /// Output format
    pub log_format: LogFormat,
    /// Record engine counters
    pub enable_metrics: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "workspace-engine".to_string(),
            log_filter: "info".to_string(),
            log_format: LogFormat::Pretty,
            enable_metrics: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MonitoringConfig::default();
        assert_eq!(config.service_name, "workspace-engine");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.enable_metrics);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
