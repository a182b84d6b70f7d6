use crate::ExecutionPointerId;
use thiserror::Error;

/// Result type for workflow model operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors raised while manipulating an instance's in-memory model
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("duplicate execution pointer id: {0}")]
    DuplicatePointerId(ExecutionPointerId),

    #[error("execution pointer not found: {0}")]
    PointerNotFound(ExecutionPointerId),
}
