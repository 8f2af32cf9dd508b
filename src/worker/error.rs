use crate::engine::state::Failure;
use thiserror::Error;

/// Errors raised by workflow and activity code and by the worker running it
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    /// Business failure reported by the function itself
    #[error("{0}")]
    Application(String),

    #[error("activity '{activity}' failed: {message}")]
    ActivityFailed { activity: String, message: String },

    #[error("activity '{activity}' timed out: {message}")]
    ActivityTimedOut { activity: String, message: String },

    #[error("'{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("'{0}' is not registered on this worker")]
    NotRegistered(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The coordinator could not be reached or refused a request
    #[error("engine error: {0}")]
    Engine(String),
}

impl WorkflowError {
    pub fn application(message: impl Into<String>) -> Self {
        WorkflowError::Application(message.into())
    }

    /// Failure record reported to the engine for this error
    pub fn to_failure(&self) -> Failure {
        Failure::application(self.to_string())
    }
}

impl From<crate::client::RequestError> for WorkflowError {
    fn from(e: crate::client::RequestError) -> Self {
        WorkflowError::Engine(e.to_string())
    }
}
