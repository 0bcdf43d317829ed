use anyhow::{Context, Result};
use rollout_server::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration first so LOG_LEVEL / LOG_FORMAT apply to logging
    let config = ServerConfig::load().context("Failed to load configuration")?;

    rollout_monitoring::init_logging(&config.monitoring()).context("Failed to initialize logging")?;

    rollout_server::run(config).await.context("Server error")?;

    Ok(())
}
