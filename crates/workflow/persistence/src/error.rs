use thiserror::Error;
use workflow_types::WorkflowInstanceId;

/// Result type for persistence operations.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Persistence-layer errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("workflow instance not found: {0}")]
    NotFound(WorkflowInstanceId),

    #[error("workflow instance already exists: {0}")]
    DuplicateId(WorkflowInstanceId),

    #[error("concurrency conflict on {id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        id: WorkflowInstanceId,
        expected: u64,
        actual: u64,
    },

    #[error("transient i/o failure: {0}")]
    TransientIo(String),

    #[error("corruption detected for {id}: {reason}")]
    Corruption {
        id: WorkflowInstanceId,
        reason: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PersistenceError {
    /// The caller may retry: re-read and resubmit after a conflict, back off
    /// after a transient failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. } | Self::TransientIo(_))
    }

    /// A stored invariant was violated; the record must not be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

impl From<config::ConfigError> for PersistenceError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
