//! Connection to the coordinator and the workflow submission API

pub mod connection;
pub mod error;
pub mod workflow_client;

pub use connection::{Connection, DialOptions, SharedConnection};
pub use error::{ClientError, ConnectionError, RequestError, SubmissionError};
pub use workflow_client::{RunHandle, WorkflowClient, WorkflowInvocation, WorkflowResult};
