//! Client-side API for starting workflows and waiting on their results

use crate::client::connection::{Connection, SharedConnection};
use crate::client::error::ClientError;
use crate::engine::messages::{
    millis, ResultQuery, StartWorkflowRequest, WorkflowIdConflictPolicy,
};
use crate::engine::state::ExecutionState;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Longest single result wait sent to the coordinator; longer waits loop
const MAX_RESULT_WAIT: Duration = Duration::from_secs(25);

pub type WorkflowResult<T> = Result<T, ClientError>;

/// Everything needed to submit one workflow run
#[derive(Clone, Debug)]
pub struct WorkflowInvocation<I> {
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: I,
    /// Overall execution timeout, enforced by the engine
    pub timeout: Duration,
    pub conflict_policy: WorkflowIdConflictPolicy,
}

impl<I> WorkflowInvocation<I> {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
        input: I,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            input,
            timeout: Duration::from_secs(60),
            conflict_policy: WorkflowIdConflictPolicy::Fail,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_conflict_policy(mut self, policy: WorkflowIdConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }
}

/// Handle for submitting workflows through the shared connection.
///
/// Cheap to clone; every clone sees the connection once the client role has
/// published it.
#[derive(Clone, Debug)]
pub struct WorkflowClient {
    identity: String,
    connection: SharedConnection,
}

impl WorkflowClient {
    pub fn new(identity: impl Into<String>, connection: SharedConnection) -> Self {
        Self {
            identity: identity.into(),
            connection,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn connection(&self) -> WorkflowResult<Connection> {
        self.connection.get().ok_or(ClientError::NotConnected)
    }

    /// Submit a workflow run and return a handle to its result
    pub async fn start<I: Serialize>(
        &self,
        invocation: &WorkflowInvocation<I>,
    ) -> WorkflowResult<RunHandle> {
        let connection = self.connection()?;
        let input = serde_json::to_value(&invocation.input)
            .map_err(|e| ClientError::Serialization(e.to_string()))?;

        let request = StartWorkflowRequest {
            workflow_id: invocation.workflow_id.clone(),
            workflow_type: invocation.workflow_type.clone(),
            task_queue: invocation.task_queue.clone(),
            input,
            execution_timeout_ms: millis(invocation.timeout).max(1),
            conflict_policy: invocation.conflict_policy,
            identity: self.identity.clone(),
        };
        let started = connection.start_workflow(&request).await?;

        Ok(RunHandle {
            workflow_id: started.workflow_id,
            run_id: started.run_id,
            attached: started.attached,
            connection,
        })
    }

    /// Submit a workflow run and wait for its result within the invocation's
    /// timeout
    pub async fn execute<I, O>(&self, invocation: WorkflowInvocation<I>) -> WorkflowResult<O>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let started_at = Instant::now();
        let handle = self.start(&invocation).await?;
        let remaining = invocation.timeout.saturating_sub(started_at.elapsed());
        handle.get(remaining).await
    }
}

/// A submitted workflow run
#[derive(Clone, Debug)]
pub struct RunHandle {
    workflow_id: String,
    run_id: String,
    attached: bool,
    connection: Connection,
}

impl RunHandle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// True if the submission attached to a run that was already open
    pub fn attached(&self) -> bool {
        self.attached
    }

    /// Wait up to `timeout` for the run to close and decode its result.
    ///
    /// A timeout too large to represent as a deadline waits until the run
    /// closes.
    pub async fn get<O: DeserializeOwned>(&self, timeout: Duration) -> WorkflowResult<O> {
        let until = Instant::now().checked_add(timeout);

        loop {
            let wait = until
                .map_or(MAX_RESULT_WAIT, |until| {
                    until.saturating_duration_since(Instant::now())
                })
                .min(MAX_RESULT_WAIT);
            let query = ResultQuery {
                id: self.workflow_id.clone(),
                run_id: Some(self.run_id.clone()),
                wait_ms: Some(millis(wait)),
            };
            let result = self.connection.workflow_result(&query).await?;

            match result.state {
                ExecutionState::Completed => {
                    let value = result.value.unwrap_or(serde_json::Value::Null);
                    return serde_json::from_value(value)
                        .map_err(|e| ClientError::Serialization(e.to_string()));
                }
                ExecutionState::Failed => {
                    return Err(ClientError::ExecutionFailed {
                        workflow_id: self.workflow_id.clone(),
                        run_id: self.run_id.clone(),
                        message: failure_message(result.failure),
                    })
                }
                ExecutionState::TimedOut => {
                    return Err(ClientError::ExecutionTimedOut {
                        workflow_id: self.workflow_id.clone(),
                        run_id: Some(self.run_id.clone()),
                        message: failure_message(result.failure),
                    })
                }
                ExecutionState::Scheduled | ExecutionState::Running => {
                    if until.map_or(false, |until| Instant::now() >= until) {
                        return Err(ClientError::ExecutionTimedOut {
                            workflow_id: self.workflow_id.clone(),
                            run_id: Some(self.run_id.clone()),
                            message: format!("no result within {:?}", timeout),
                        });
                    }
                }
            }
        }
    }
}

fn failure_message(failure: Option<crate::engine::state::Failure>) -> String {
    failure
        .map(|f| f.message)
        .unwrap_or_else(|| "no failure detail reported".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconnected_client_reports_not_connected() {
        let client = WorkflowClient::new("node1", SharedConnection::new());
        assert!(!client.is_connected());

        let invocation = WorkflowInvocation::new("wf", "GreetingWorkflow", "QUEUE", "World");
        let err = client.start(&invocation).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));

        let err = client
            .execute::<_, String>(invocation)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[test]
    fn test_invocation_builder() {
        let invocation = WorkflowInvocation::new("wf", "GreetingWorkflow", "QUEUE", 7u32)
            .with_timeout(Duration::from_secs(3))
            .with_conflict_policy(WorkflowIdConflictPolicy::UseExisting);
        assert_eq!(invocation.timeout, Duration::from_secs(3));
        assert_eq!(invocation.conflict_policy, WorkflowIdConflictPolicy::UseExisting);
        assert_eq!(invocation.input, 7);
    }
}
