//! Error types for the workspace engine server

use rollout_core::CoreError;
use rollout_snapshot_store::SnapshotStoreError;
use thiserror::Error;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Reading from or appending to the event log failed
    #[error("Log error: {0}")]
    LogError(String),

    /// Snapshot blob or registry failure
    #[error("Snapshot store error: {0}")]
    SnapshotStore(#[from] SnapshotStoreError),

    /// Engine rejected an event or a snapshot
    #[error("Engine error: {0}")]
    Engine(#[from] CoreError),

    /// Loading initial state from the database failed
    #[error("Bootstrap error: {0}")]
    BootstrapError(String),

    /// The job-agent boundary failed
    #[error("Dispatch error: {0}")]
    DispatchError(String),

    /// The operation timed out
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A background task stopped unexpectedly
    #[error("Task error: {0}")]
    TaskError(String),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ServerError::LogError(_) | ServerError::Timeout(_) | ServerError::BootstrapError(_) => true,
            ServerError::SnapshotStore(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Engine(CoreError::SerializationError(err.to_string()))
    }
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(err: tokio::task::JoinError) -> Self {
        ServerError::TaskError(err.to_string())
    }
}
