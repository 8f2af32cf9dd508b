//! Poll loop that claims tasks from one queue and runs them

use crate::bootstrap::role::panic_message;
use crate::client::Connection;
use crate::engine::messages::{millis, CompleteTaskRequest, PollTaskRequest, Task};
use crate::engine::state::{ExecutionKind, Failure, TaskOutcome};
use crate::worker::context::{ActivityContext, WorkflowContext};
use crate::worker::error::WorkflowError;
use crate::worker::registry::Registry;
use futures::FutureExt;
use slog::{debug, info, o, warn, Logger};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// Workflow tasks run at the same time. A workflow keeps its slot while
    /// it waits on activities, so activities get slots of their own.
    pub max_concurrent_workflow_tasks: usize,
    /// Activities run at the same time
    pub max_concurrent_activities: usize,
    /// Long-poll wait sent with each poll request
    pub poll_wait: Duration,
    /// First delay after a failed poll, doubled on each further failure
    pub error_backoff: Duration,
    pub max_error_backoff: Duration,
}

impl WorkerOptions {
    fn slots(&self, kind: ExecutionKind) -> usize {
        match kind {
            ExecutionKind::Workflow => self.max_concurrent_workflow_tasks,
            ExecutionKind::Activity => self.max_concurrent_activities,
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_workflow_tasks: 16,
            max_concurrent_activities: 16,
            poll_wait: Duration::from_secs(10),
            error_backoff: Duration::from_millis(200),
            max_error_backoff: Duration::from_secs(5),
        }
    }
}

struct WorkerInner {
    identity: String,
    task_queue: String,
    registry: Registry,
    connection: Connection,
    logger: Logger,
}

/// Serves the registered workflows and activities on one task queue
pub struct Worker {
    inner: Arc<WorkerInner>,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        identity: String,
        task_queue: String,
        registry: Registry,
        connection: Connection,
        options: WorkerOptions,
        logger: Logger,
    ) -> Self {
        let logger = logger.new(o!("task_queue" => task_queue.clone()));
        Self {
            inner: Arc::new(WorkerInner {
                identity,
                task_queue,
                registry,
                connection,
                logger,
            }),
            options,
        }
    }

    /// Poll and run tasks until `shutdown` fires. In-flight tasks are
    /// abandoned on shutdown; the engine times them out.
    ///
    /// Workflow tasks and activities are polled separately, each against its
    /// own slot limit, so workflows waiting on activities never starve them.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(self.inner.logger, "Worker polling";
            "workflows" => self.inner.registry.workflow_names().join(","),
            "activities" => self.inner.registry.activity_names().join(",")
        );

        tokio::join!(
            self.poll_loop(ExecutionKind::Workflow, &shutdown),
            self.poll_loop(ExecutionKind::Activity, &shutdown),
        );
    }

    async fn poll_loop(&self, kind: ExecutionKind, shutdown: &CancellationToken) {
        let inner = &self.inner;
        let logger = inner.logger.new(o!("poller" => kind.as_str()));
        let semaphore = Arc::new(Semaphore::new(self.options.slots(kind).max(1)));
        let mut in_flight = JoinSet::new();
        let mut backoff = self.options.error_backoff;

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    warn!(logger, "Task runner ended abnormally"; "error" => %e);
                }
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let request = PollTaskRequest {
                task_queue: inner.task_queue.clone(),
                identity: inner.identity.clone(),
                wait_ms: millis(self.options.poll_wait),
                kind: Some(kind),
            };
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = inner.connection.poll_task(&request) => polled,
            };

            match polled {
                Ok(Some(task)) => {
                    backoff = self.options.error_backoff;
                    let inner = self.inner.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        inner.handle(task).await;
                    });
                }
                Ok(None) => {
                    backoff = self.options.error_backoff;
                }
                Err(e) => {
                    warn!(logger, "Poll failed, backing off";
                        "error" => %e,
                        "backoff_ms" => millis(backoff)
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.options.max_error_backoff);
                }
            }
        }

        let abandoned = in_flight.len();
        in_flight.shutdown().await;
        info!(logger, "Poller stopped"; "abandoned_tasks" => abandoned);
    }
}

impl WorkerInner {
    async fn handle(&self, task: Task) {
        // A deadline too far out to represent is no deadline.
        let deadline = task
            .deadline_ms
            .and_then(|ms| Instant::now().checked_add(Duration::from_millis(ms)));
        let outcome = match task.token.kind {
            ExecutionKind::Workflow => self.run_workflow(&task, deadline).await,
            ExecutionKind::Activity => self.run_activity(&task, deadline).await,
        };

        let request = CompleteTaskRequest {
            token: task.token,
            outcome,
        };
        match self.connection.complete_task(&request).await {
            Ok(()) => debug!(self.logger, "Task outcome reported";
                "kind" => request.token.kind.as_str(),
                "id" => &request.token.id,
                "state" => request.outcome.state().as_str()
            ),
            // Most commonly the engine already timed the task out.
            Err(e) => warn!(self.logger, "Task outcome rejected";
                "kind" => request.token.kind.as_str(),
                "id" => &request.token.id,
                "error" => %e
            ),
        }
    }

    async fn run_workflow(&self, task: &Task, deadline: Option<Instant>) -> TaskOutcome {
        let function = match self.registry.workflow(&task.type_name) {
            Some(function) => function,
            None => return unregistered(&task.type_name),
        };
        let logger = self.logger.new(o!(
            "workflow_id" => task.workflow_id.clone(),
            "run_id" => task.workflow_run_id.clone()
        ));
        let context = WorkflowContext::new(
            task.workflow_id.clone(),
            task.workflow_run_id.clone(),
            task.task_queue.clone(),
            deadline,
            self.connection.clone(),
            logger,
        );
        run_bounded(function.execute(task.input.clone(), context), deadline).await
    }

    async fn run_activity(&self, task: &Task, deadline: Option<Instant>) -> TaskOutcome {
        let function = match self.registry.activity(&task.type_name) {
            Some(function) => function,
            None => return unregistered(&task.type_name),
        };
        let logger = self.logger.new(o!(
            "activity_id" => task.token.id.clone(),
            "workflow_id" => task.workflow_id.clone()
        ));
        let context = ActivityContext::new(
            task.token.id.clone(),
            task.type_name.clone(),
            task.workflow_id.clone(),
            task.task_queue.clone(),
            deadline,
            logger,
        );
        run_bounded(function.execute(task.input.clone(), context), deadline).await
    }
}

fn unregistered(type_name: &str) -> TaskOutcome {
    TaskOutcome::Failed {
        failure: WorkflowError::NotRegistered(type_name.to_string()).to_failure(),
    }
}

/// Run a task body, stopping at its deadline and turning panics into failures
async fn run_bounded<F>(body: F, deadline: Option<Instant>) -> TaskOutcome
where
    F: Future<Output = Result<serde_json::Value, WorkflowError>>,
{
    let body = AssertUnwindSafe(body).catch_unwind();
    let finished = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, body).await {
            Ok(finished) => finished,
            Err(_) => {
                return TaskOutcome::TimedOut {
                    message: "start-to-close deadline exceeded".to_string(),
                }
            }
        },
        None => body.await,
    };

    match finished {
        Ok(Ok(value)) => TaskOutcome::Completed { value },
        Ok(Err(e)) => TaskOutcome::Failed {
            failure: e.to_failure(),
        },
        Err(panic) => TaskOutcome::Failed {
            failure: Failure::application(format!("task panicked: {}", panic_message(panic))),
        },
    }
}
