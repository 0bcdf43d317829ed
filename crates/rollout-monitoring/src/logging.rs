//! Structured logging using tracing.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{LogFormat, MonitoringConfig};

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `config.log_filter`. Fails if a global subscriber is
/// already set or the filter does not parse.
pub fn init_logging(config: &MonitoringConfig) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_filter)
            .with_context(|| format!("Invalid log filter '{}'", config.log_filter))?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.log_format {
        LogFormat::Json => {
            let json_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            tracing::subscriber::set_global_default(registry.with(json_layer))
        }
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            tracing::subscriber::set_global_default(registry.with(fmt_layer))
        }
    }
    .context("Failed to set global default subscriber")?;

    info!(
        service_name = %config.service_name,
        log_format = ?config.log_format,
        metrics = config.enable_metrics,
        "Logging initialized"
    );
    Ok(())
}

/// Log a result on the way through
pub trait LogExt<T, E> {
    /// Log the error with `message` before returning
    fn log_err(self, message: &str) -> Result<T, E>;

    /// Log `message` at debug level on success
    fn log_ok(self, message: &str) -> Result<T, E>;
}

impl<T, E: std::fmt::Display> LogExt<T, E> for Result<T, E> {
    fn log_err(self, message: &str) -> Result<T, E> {
        if let Err(ref e) = self {
            tracing::error!(error = %e, "{}", message);
        }
        self
    }

    fn log_ok(self, message: &str) -> Result<T, E> {
        if self.is_ok() {
            tracing::debug!("{}", message);
        }
        self
    }
}
