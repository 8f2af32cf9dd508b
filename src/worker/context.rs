//! Context handed to workflow and activity functions

use crate::client::Connection;
use crate::engine::messages::{millis, ResultQuery, ScheduleActivityRequest};
use crate::engine::state::ExecutionState;
use crate::worker::error::WorkflowError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::{debug, Logger};
use std::time::Duration;
use tokio::time::Instant;

/// Longest single wait on an activity result; longer waits loop
const MAX_ACTIVITY_WAIT: Duration = Duration::from_secs(25);

/// Options for a single activity invocation
#[derive(Clone, Debug)]
pub struct ActivityOptions {
    /// Time the activity may run once a worker claims it
    pub start_to_close_timeout: Duration,
    /// Queue to schedule on; defaults to the workflow's own queue
    pub task_queue: Option<String>,
}

impl ActivityOptions {
    pub fn with_start_to_close(timeout: Duration) -> Self {
        Self {
            start_to_close_timeout: timeout,
            task_queue: None,
        }
    }

    pub fn on_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }
}

/// Context for a running workflow
#[derive(Clone)]
pub struct WorkflowContext {
    workflow_id: String,
    run_id: String,
    task_queue: String,
    deadline: Option<Instant>,
    connection: Connection,
    logger: Logger,
}

impl WorkflowContext {
    pub(crate) fn new(
        workflow_id: String,
        run_id: String,
        task_queue: String,
        deadline: Option<Instant>,
        connection: Connection,
        logger: Logger,
    ) -> Self {
        Self {
            workflow_id,
            run_id,
            task_queue,
            deadline,
            connection,
            logger,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Time left before the engine times this workflow out
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Schedule an activity and wait for its outcome.
    ///
    /// The activity goes through the coordinator like any other task, so it
    /// may run on any worker polling the target queue.
    pub async fn execute_activity<I, O>(
        &self,
        activity_type: &str,
        input: I,
        options: ActivityOptions,
    ) -> Result<O, WorkflowError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let input =
            serde_json::to_value(input).map_err(|e| WorkflowError::Serialization(e.to_string()))?;
        let request = ScheduleActivityRequest {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
            activity_type: activity_type.to_string(),
            task_queue: options
                .task_queue
                .unwrap_or_else(|| self.task_queue.clone()),
            input,
            start_to_close_timeout_ms: millis(options.start_to_close_timeout).max(1),
        };
        let scheduled = self.connection.schedule_activity(&request).await?;
        debug!(self.logger, "Activity scheduled";
            "activity_id" => &scheduled.activity_id,
            "activity_type" => activity_type
        );

        loop {
            let query = ResultQuery {
                id: scheduled.activity_id.clone(),
                run_id: None,
                wait_ms: Some(millis(MAX_ACTIVITY_WAIT)),
            };
            let result = self.connection.activity_result(&query).await?;
            let message = result.failure.map(|f| f.message).unwrap_or_default();

            match result.state {
                ExecutionState::Completed => {
                    let value = result.value.unwrap_or(serde_json::Value::Null);
                    return serde_json::from_value(value)
                        .map_err(|e| WorkflowError::Deserialization(e.to_string()));
                }
                ExecutionState::Failed => {
                    return Err(WorkflowError::ActivityFailed {
                        activity: activity_type.to_string(),
                        message,
                    })
                }
                ExecutionState::TimedOut => {
                    return Err(WorkflowError::ActivityTimedOut {
                        activity: activity_type.to_string(),
                        message,
                    })
                }
                // The engine enforces the activity's deadline, so this loop ends.
                ExecutionState::Scheduled | ExecutionState::Running => {}
            }
        }
    }
}

/// Context for a running activity
#[derive(Clone)]
pub struct ActivityContext {
    activity_id: String,
    activity_type: String,
    workflow_id: String,
    task_queue: String,
    deadline: Option<Instant>,
    logger: Logger,
}

impl ActivityContext {
    pub(crate) fn new(
        activity_id: String,
        activity_type: String,
        workflow_id: String,
        task_queue: String,
        deadline: Option<Instant>,
        logger: Logger,
    ) -> Self {
        Self {
            activity_id,
            activity_type,
            workflow_id,
            task_queue,
            deadline,
            logger,
        }
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    pub fn activity_type(&self) -> &str {
        &self.activity_type
    }

    /// Workflow that scheduled this activity
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}
