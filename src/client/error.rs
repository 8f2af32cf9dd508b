//! Error types for talking to the coordinator

use crate::engine::messages::{ErrorCode, ErrorResponse};
use thiserror::Error;

/// The coordinator could not be reached
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Every dial attempt failed
    #[error("cannot reach coordinator at {host_port} after {attempts} attempt(s): {reason}")]
    Unreachable {
        host_port: String,
        attempts: u32,
        reason: String,
    },

    /// A request on an established connection failed in transit
    #[error("request to coordinator failed: {0}")]
    Request(String),

    /// The coordinator answered with something we could not understand
    #[error("unexpected response from coordinator: {0}")]
    Protocol(String),

    /// The coordinator is shutting down
    #[error("coordinator is unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a single HTTP exchange with the engine
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("transport error: {0}")]
    Transport(String),

    /// The engine rejected the request with a typed error
    #[error("{}", .0.message)]
    Engine(ErrorResponse),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for RequestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RequestError::Protocol(e.to_string())
        } else {
            RequestError::Transport(e.to_string())
        }
    }
}

/// The engine refused a workflow invocation
#[derive(Debug, Clone, Error)]
pub enum SubmissionError {
    /// A run with the same workflow ID is still open
    #[error("{0}")]
    AlreadyStarted(String),

    #[error("{0}")]
    InvalidTaskQueue(String),

    #[error("invocation rejected: {0}")]
    Rejected(String),
}

/// Errors returned by [`WorkflowClient`](crate::client::WorkflowClient)
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// No connection to the coordinator has been established yet
    #[error("workflow client is not connected")]
    NotConnected,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),

    /// The workflow function returned an error
    #[error("workflow '{workflow_id}' (run {run_id}) failed: {message}")]
    ExecutionFailed {
        workflow_id: String,
        run_id: String,
        message: String,
    },

    /// The deadline elapsed before the workflow finished
    #[error("workflow '{workflow_id}' timed out: {message}")]
    ExecutionTimedOut {
        workflow_id: String,
        run_id: Option<String>,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<RequestError> for ClientError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Transport(reason) => ConnectionError::Request(reason).into(),
            RequestError::Protocol(reason) => ConnectionError::Protocol(reason).into(),
            RequestError::Engine(err) => match err.code {
                ErrorCode::AlreadyStarted => SubmissionError::AlreadyStarted(err.message).into(),
                ErrorCode::InvalidTaskQueue => SubmissionError::InvalidTaskQueue(err.message).into(),
                ErrorCode::ShuttingDown => ConnectionError::Unavailable(err.message).into(),
                ErrorCode::InvalidRequest | ErrorCode::NotFound | ErrorCode::AlreadyClosed => {
                    SubmissionError::Rejected(err.message).into()
                }
            },
        }
    }
}

impl ClientError {
    /// Whether retrying the same call may succeed.
    ///
    /// `AlreadyStarted` is not retriable: the same workflow ID keeps failing
    /// until the open run closes. Attach with `UseExisting` instead.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ClientError::NotConnected | ClientError::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_error(code: ErrorCode) -> RequestError {
        RequestError::Engine(ErrorResponse {
            code,
            message: "nope".to_string(),
        })
    }

    #[test]
    fn test_engine_errors_map_to_client_errors() {
        assert!(matches!(
            ClientError::from(engine_error(ErrorCode::InvalidTaskQueue)),
            ClientError::Submission(SubmissionError::InvalidTaskQueue(_))
        ));
        assert!(matches!(
            ClientError::from(engine_error(ErrorCode::AlreadyStarted)),
            ClientError::Submission(SubmissionError::AlreadyStarted(_))
        ));
        assert!(matches!(
            ClientError::from(engine_error(ErrorCode::ShuttingDown)),
            ClientError::Connection(ConnectionError::Unavailable(_))
        ));
        assert!(matches!(
            ClientError::from(RequestError::Transport("reset".to_string())),
            ClientError::Connection(ConnectionError::Request(_))
        ));
    }

    #[test]
    fn test_retriable_errors() {
        assert!(ClientError::NotConnected.is_retriable());
        assert!(ClientError::from(ConnectionError::Request("reset".to_string())).is_retriable());
        assert!(!ClientError::Serialization("bad".to_string()).is_retriable());
        assert!(!ClientError::from(engine_error(ErrorCode::AlreadyStarted)).is_retriable());
    }
}
