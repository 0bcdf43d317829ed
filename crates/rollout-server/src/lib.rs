//! Workspace engine server.
//!
//! Connects the engine to the partitioned event log: workspaces are sharded
//! to partitions by a stable hash, each owned partition is consumed by one
//! task that restores snapshots, replays up to them and then processes
//! events live. Job events are published back onto the log, jobs are handed
//! to the job-agent boundary, and a ticker turns scheduler deadlines into
//! `workspace.tick` events.

pub mod bootstrap;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod log;
pub mod partition;
pub mod retry;
pub mod server;
pub mod snapshots;
pub mod ticker;

pub use config::ServerConfig;
pub use consumer::{ConsumerContext, ConsumerStats, PartitionConsumer, WorkspaceStats};
pub use dispatch::{DispatchError, JobDispatcher, Outbox, VerificationRunner};
pub use error::{ServerError, ServerResult};
pub use log::{InMemoryPartitionLog, LogProducer, LogRecord, PartitionLog, PartitionReader};
pub use partition::partition_of;
pub use server::{EngineServer, ServerComponents};

use tracing::info;

/// Run the server until Ctrl-C
pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let server = EngineServer::build(config).await?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
}
