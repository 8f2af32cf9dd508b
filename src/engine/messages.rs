//! JSON messages exchanged with the coordinator's HTTP front-end

use crate::engine::state::{ExecutionKind, ExecutionState, Failure, TaskOutcome};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Health check response, also used by `dial` to verify the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub identity: String,
    pub cluster_id: Uuid,
}

/// What to do when a workflow ID is reused while its previous run is open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowIdConflictPolicy {
    /// Reject the new submission
    #[default]
    Fail,
    /// Attach to the run that is still open
    UseExisting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowRequest {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub execution_timeout_ms: u64,
    #[serde(default)]
    pub conflict_policy: WorkflowIdConflictPolicy,
    #[serde(default)]
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowResponse {
    pub workflow_id: String,
    pub run_id: String,
    /// True when the request attached to an already open run
    pub attached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleActivityRequest {
    pub workflow_id: String,
    pub run_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub start_to_close_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleActivityResponse {
    pub activity_id: String,
}

/// Query for `/workflows/result` and `/activities/result`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultQuery {
    pub id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

/// Snapshot of an execution; `value` and `failure` are set only once closed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: String,
    pub run_id: String,
    pub state: ExecutionState,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub failure: Option<Failure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollTaskRequest {
    pub task_queue: String,
    pub identity: String,
    pub wait_ms: u64,
    /// Claim only this kind of task; any kind when absent
    #[serde(default)]
    pub kind: Option<ExecutionKind>,
}

/// Identifies a claimed execution when reporting its outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskToken {
    pub kind: ExecutionKind,
    pub id: String,
    pub run_id: String,
}

/// A unit of work handed to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub token: TaskToken,
    pub type_name: String,
    pub input: serde_json::Value,
    /// Owning workflow (the workflow itself for workflow tasks)
    pub workflow_id: String,
    pub workflow_run_id: String,
    pub task_queue: String,
    /// Time left before the engine times the task out
    pub deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTaskRequest {
    pub token: TaskToken,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AlreadyStarted,
    InvalidTaskQueue,
    InvalidRequest,
    NotFound,
    AlreadyClosed,
    ShuttingDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

/// Milliseconds in `duration` as sent on the wire, saturating at `u64::MAX`
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
