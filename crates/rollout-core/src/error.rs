use thiserror::Error;

/// Core error type for the Rollout engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Referenced entity does not exist in the workspace
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Payload failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Event envelope or payload could not be decoded
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// The event type is not known to the router
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// A selector could not be compiled or evaluated
    #[error("Selector error: {0}")]
    SelectorError(String),

    /// An expression could not be evaluated
    #[error("Expression evaluation error: {0}")]
    ExpressionError(String),

    /// A recurrence rule could not be parsed
    #[error("Recurrence rule error: {0}")]
    RecurrenceError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Snapshot could not be encoded or decoded
    #[error("Snapshot error: {0}")]
    SnapshotError(String),

    /// A write violated resource-provider ownership
    #[error("Ownership violation: {0}")]
    OwnershipViolation(String),

    /// Internal state is inconsistent; the workspace must be quarantined
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The workspace no longer accepts events
    #[error("Workspace quarantined: {0}")]
    WorkspaceQuarantined(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result alias used across the core crates
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Whether the error came from a malformed event or payload.
    ///
    /// Decode failures are logged and the event is skipped; processing of the
    /// partition continues.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            CoreError::DecodeError(_)
                | CoreError::UnknownEventType(_)
                | CoreError::SerializationError(_)
                | CoreError::ValidationError(_)
                | CoreError::OwnershipViolation(_)
        )
    }

    /// Whether the workspace must stop accepting events after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::InvariantViolation(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
