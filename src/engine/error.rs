//! Errors raised by the engine

use crate::engine::messages::ErrorCode;
use crate::engine::state::{ExecutionKind, ExecutionState};
use thiserror::Error;

/// Longest task queue name the engine accepts
pub const MAX_TASK_QUEUE_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A run with this workflow ID is still open
    #[error("workflow '{workflow_id}' is already running as run {run_id}")]
    AlreadyStarted { workflow_id: String, run_id: String },

    #[error("invalid task queue name {0:?}")]
    InvalidTaskQueue(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: ExecutionKind, id: String },

    /// The execution already reached a terminal state
    #[error("{kind} '{id}' is already {state}")]
    AlreadyClosed {
        kind: ExecutionKind,
        id: String,
        state: ExecutionState,
    },

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::AlreadyStarted { .. } => ErrorCode::AlreadyStarted,
            EngineError::InvalidTaskQueue(_) => ErrorCode::InvalidTaskQueue,
            EngineError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            EngineError::NotFound { .. } => ErrorCode::NotFound,
            EngineError::AlreadyClosed { .. } => ErrorCode::AlreadyClosed,
            EngineError::ShuttingDown => ErrorCode::ShuttingDown,
        }
    }
}

/// Check that `name` is usable as a task queue: non-empty, at most
/// [`MAX_TASK_QUEUE_LEN`] bytes, no whitespace or control characters.
pub fn validate_task_queue(name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_TASK_QUEUE_LEN
        && !name.chars().any(|c| c.is_whitespace() || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidTaskQueue(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_queue_validation() {
        assert!(validate_task_queue("DEFERRAL_TASK_QUEUE").is_ok());
        assert!(validate_task_queue("orders.v2").is_ok());

        assert!(validate_task_queue("").is_err());
        assert!(validate_task_queue("has space").is_err());
        assert!(validate_task_queue("tab\tqueue").is_err());
        assert!(validate_task_queue(&"q".repeat(MAX_TASK_QUEUE_LEN + 1)).is_err());
    }
}
