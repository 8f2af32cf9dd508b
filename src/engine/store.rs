//! In-memory execution store and task queues owned by the coordinator.
//!
//! Workflows and activities share one state machine. Submissions land on a
//! named task queue as `Scheduled` executions; workers claim them with a long
//! poll, which moves them to `Running`, and report a terminal outcome. Result
//! waiters and the reaper enforce deadlines.

use crate::engine::error::{validate_task_queue, EngineError};
use crate::engine::messages::{
    millis, CompleteTaskRequest, ExecutionResult, PollTaskRequest, ResultQuery, ScheduleActivityRequest,
    ScheduleActivityResponse, StartWorkflowRequest, StartWorkflowResponse, Task, TaskToken,
    WorkflowIdConflictPolicy,
};
use crate::engine::state::{ExecutionKind, ExecutionState, Failure, TaskOutcome};
use parking_lot::Mutex;
use slog::{debug, info, warn, Logger};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tuning knobs for the engine
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Upper bound on any long poll (task poll or result wait)
    pub max_long_poll: Duration,
    /// How often overdue executions are swept
    pub reap_interval: Duration,
    /// How long closed executions stay queryable
    pub retention: Duration,
    /// Capacity of the internal event channel
    pub event_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_long_poll: Duration::from_secs(30),
            reap_interval: Duration::from_millis(100),
            retention: Duration::from_secs(600),
            event_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug)]
enum EngineEvent {
    Scheduled {
        task_queue: String,
        kind: ExecutionKind,
    },
    Closed { kind: ExecutionKind, id: String },
}

struct Execution {
    kind: ExecutionKind,
    id: String,
    run_id: String,
    type_name: String,
    task_queue: String,
    input: serde_json::Value,
    state: ExecutionState,
    deadline: Option<Instant>,
    start_to_close: Option<Duration>,
    workflow_id: String,
    workflow_run_id: String,
    next_activity: u64,
    value: Option<serde_json::Value>,
    failure: Option<Failure>,
    closed_at: Option<Instant>,
}

impl Execution {
    fn token(&self) -> TaskToken {
        TaskToken {
            kind: self.kind,
            id: self.id.clone(),
            run_id: self.run_id.clone(),
        }
    }

    fn advance(&mut self, next: ExecutionState) -> Result<(), EngineError> {
        if self.state.can_transition_to(next) {
            self.state = next;
            Ok(())
        } else if self.state.is_terminal() {
            Err(EngineError::AlreadyClosed {
                kind: self.kind,
                id: self.id.clone(),
                state: self.state,
            })
        } else {
            Err(EngineError::InvalidRequest(format!(
                "{} '{}' cannot move from {} to {}",
                self.kind, self.id, self.state, next
            )))
        }
    }

    fn claim(&mut self, now: Instant) -> Result<(), EngineError> {
        self.advance(ExecutionState::Running)?;
        if let Some(start_to_close) = self.start_to_close {
            // Too far out to represent means no deadline.
            self.deadline = now.checked_add(start_to_close);
        }
        Ok(())
    }

    fn close(&mut self, outcome: TaskOutcome, now: Instant) -> Result<(), EngineError> {
        self.advance(outcome.state())?;
        match outcome {
            TaskOutcome::Completed { value } => self.value = Some(value),
            TaskOutcome::Failed { failure } => self.failure = Some(failure),
            TaskOutcome::TimedOut { message } => self.failure = Some(Failure::timed_out(message)),
        }
        self.closed_at = Some(now);
        Ok(())
    }

    /// Time the execution out if its deadline has passed. Returns true when
    /// this call closed it.
    fn expire(&mut self, now: Instant) -> bool {
        let overdue = matches!(self.deadline, Some(deadline) if now >= deadline);
        if !overdue || self.state.is_terminal() {
            return false;
        }
        let message = match self.state {
            ExecutionState::Scheduled => "deadline exceeded before any worker claimed the task",
            _ => "deadline exceeded while running",
        };
        self.close(
            TaskOutcome::TimedOut {
                message: message.to_string(),
            },
            now,
        )
        .is_ok()
    }

    fn snapshot(&self) -> ExecutionResult {
        ExecutionResult {
            id: self.id.clone(),
            run_id: self.run_id.clone(),
            state: self.state,
            value: self.value.clone(),
            failure: self.failure.clone(),
        }
    }

    fn to_task(&self, now: Instant) -> Task {
        Task {
            token: self.token(),
            type_name: self.type_name.clone(),
            input: self.input.clone(),
            workflow_id: self.workflow_id.clone(),
            workflow_run_id: self.workflow_run_id.clone(),
            task_queue: self.task_queue.clone(),
            deadline_ms: self
                .deadline
                .map(|deadline| millis(deadline.saturating_duration_since(now))),
        }
    }
}

/// Pending tokens of one task queue, split by kind so workers can keep
/// separate slots for workflows and activities
#[derive(Default)]
struct TaskQueue {
    workflows: VecDeque<TaskToken>,
    activities: VecDeque<TaskToken>,
}

impl TaskQueue {
    fn push(&mut self, token: TaskToken) {
        match token.kind {
            ExecutionKind::Workflow => self.workflows.push_back(token),
            ExecutionKind::Activity => self.activities.push_back(token),
        }
    }

    /// Activities first when any kind will do: they unblock open workflows.
    fn pop(&mut self, kind: Option<ExecutionKind>) -> Option<TaskToken> {
        match kind {
            Some(ExecutionKind::Workflow) => self.workflows.pop_front(),
            Some(ExecutionKind::Activity) => self.activities.pop_front(),
            None => self
                .activities
                .pop_front()
                .or_else(|| self.workflows.pop_front()),
        }
    }

    fn len(&self) -> usize {
        self.workflows.len() + self.activities.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn retain(&mut self, mut keep: impl FnMut(&TaskToken) -> bool) {
        self.workflows.retain(|token| keep(token));
        self.activities.retain(|token| keep(token));
    }
}

#[derive(Default)]
struct EngineState {
    workflows: HashMap<String, Execution>,
    activities: HashMap<String, Execution>,
    queues: HashMap<String, TaskQueue>,
}

impl EngineState {
    fn table(&mut self, kind: ExecutionKind) -> &mut HashMap<String, Execution> {
        match kind {
            ExecutionKind::Workflow => &mut self.workflows,
            ExecutionKind::Activity => &mut self.activities,
        }
    }

    fn lookup(
        &mut self,
        kind: ExecutionKind,
        id: &str,
        run_id: Option<&str>,
    ) -> Result<&mut Execution, EngineError> {
        self.table(kind)
            .get_mut(id)
            .filter(|exec| run_id.map_or(true, |run_id| exec.run_id == run_id))
            .ok_or_else(|| EngineError::NotFound {
                kind,
                id: id.to_string(),
            })
    }

    fn enqueue(&mut self, task_queue: &str, token: TaskToken) {
        self.queues
            .entry(task_queue.to_string())
            .or_default()
            .push(token);
    }

    /// Drop tokens that no longer point at a scheduled execution, and the
    /// queues they leave empty. Returns the number of tokens dropped.
    fn purge_queues(&mut self) -> usize {
        let EngineState {
            workflows,
            activities,
            queues,
        } = self;
        let mut purged = 0;
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|token| {
                let table = match token.kind {
                    ExecutionKind::Workflow => &*workflows,
                    ExecutionKind::Activity => &*activities,
                };
                table.get(&token.id).map_or(false, |exec| {
                    exec.run_id == token.run_id && exec.state == ExecutionState::Scheduled
                })
            });
            purged += before - queue.len();
        }
        queues.retain(|_, queue| !queue.is_empty());
        purged
    }

    #[cfg(test)]
    fn queued_tokens(&self) -> usize {
        self.queues.values().map(TaskQueue::len).sum()
    }
}


/// The coordinator's engine
pub struct Engine {
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    options: EngineOptions,
    shutdown: CancellationToken,
    logger: Logger,
}

impl Engine {
    /// Create an engine whose long polls end when `shutdown` fires
    pub fn new(options: EngineOptions, shutdown: CancellationToken, logger: Logger) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            state: Mutex::new(EngineState::default()),
            events,
            options,
            shutdown,
            logger,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers simply means nobody is waiting.
        let _ = self.events.send(event);
    }

    fn emit_closed(&self, exec: &Execution) {
        self.emit(EngineEvent::Closed {
            kind: exec.kind,
            id: exec.id.clone(),
        });
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            Err(EngineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Submit a workflow invocation
    pub fn start_workflow(
        &self,
        req: StartWorkflowRequest,
    ) -> Result<StartWorkflowResponse, EngineError> {
        self.ensure_running()?;
        validate_task_queue(&req.task_queue)?;
        if req.workflow_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "workflow_id must not be empty".to_string(),
            ));
        }
        if req.workflow_type.is_empty() {
            return Err(EngineError::InvalidRequest(
                "workflow_type must not be empty".to_string(),
            ));
        }
        if req.execution_timeout_ms == 0 {
            return Err(EngineError::InvalidRequest(
                "execution timeout must be positive".to_string(),
            ));
        }

        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(existing) = state.workflows.get_mut(&req.workflow_id) {
            if existing.expire(now) {
                self.emit_closed(existing);
            }
            if !existing.state.is_terminal() {
                return match req.conflict_policy {
                    WorkflowIdConflictPolicy::Fail => Err(EngineError::AlreadyStarted {
                        workflow_id: existing.id.clone(),
                        run_id: existing.run_id.clone(),
                    }),
                    WorkflowIdConflictPolicy::UseExisting => {
                        debug!(self.logger, "Attaching to open workflow run";
                            "workflow_id" => &existing.id,
                            "run_id" => &existing.run_id
                        );
                        Ok(StartWorkflowResponse {
                            workflow_id: existing.id.clone(),
                            run_id: existing.run_id.clone(),
                            attached: true,
                        })
                    }
                };
            }
        }

        let run_id = Uuid::new_v4().to_string();
        let exec = Execution {
            kind: ExecutionKind::Workflow,
            id: req.workflow_id.clone(),
            run_id: run_id.clone(),
            type_name: req.workflow_type.clone(),
            task_queue: req.task_queue.clone(),
            input: req.input,
            state: ExecutionState::Scheduled,
            deadline: now.checked_add(Duration::from_millis(req.execution_timeout_ms)),
            start_to_close: None,
            workflow_id: req.workflow_id.clone(),
            workflow_run_id: run_id.clone(),
            next_activity: 0,
            value: None,
            failure: None,
            closed_at: None,
        };
        state.enqueue(&req.task_queue, exec.token());
        state.workflows.insert(req.workflow_id.clone(), exec);
        drop(state);

        self.emit(EngineEvent::Scheduled {
            task_queue: req.task_queue.clone(),
            kind: ExecutionKind::Workflow,
        });
        info!(self.logger, "Workflow scheduled";
            "workflow_id" => &req.workflow_id,
            "run_id" => &run_id,
            "workflow_type" => &req.workflow_type,
            "task_queue" => &req.task_queue,
            "identity" => &req.identity
        );

        Ok(StartWorkflowResponse {
            workflow_id: req.workflow_id,
            run_id,
            attached: false,
        })
    }

    /// Schedule an activity on behalf of a running workflow
    pub fn schedule_activity(
        &self,
        req: ScheduleActivityRequest,
    ) -> Result<ScheduleActivityResponse, EngineError> {
        self.ensure_running()?;
        validate_task_queue(&req.task_queue)?;
        if req.activity_type.is_empty() {
            return Err(EngineError::InvalidRequest(
                "activity_type must not be empty".to_string(),
            ));
        }
        if req.start_to_close_timeout_ms == 0 {
            return Err(EngineError::InvalidRequest(
                "start-to-close timeout must be positive".to_string(),
            ));
        }

        let now = Instant::now();
        let mut state = self.state.lock();

        let parent = state.lookup(ExecutionKind::Workflow, &req.workflow_id, Some(&req.run_id))?;
        if parent.expire(now) {
            self.emit_closed(parent);
        }
        if parent.state.is_terminal() {
            return Err(EngineError::AlreadyClosed {
                kind: ExecutionKind::Workflow,
                id: parent.id.clone(),
                state: parent.state,
            });
        }
        if parent.state != ExecutionState::Running {
            return Err(EngineError::InvalidRequest(format!(
                "workflow '{}' has not been claimed by a worker",
                parent.id
            )));
        }
        parent.next_activity += 1;
        let activity_id = format!("{}/activity-{}", parent.run_id, parent.next_activity);
        let parent_deadline = parent.deadline;

        let exec = Execution {
            kind: ExecutionKind::Activity,
            id: activity_id.clone(),
            run_id: activity_id.clone(),
            type_name: req.activity_type.clone(),
            task_queue: req.task_queue.clone(),
            input: req.input,
            state: ExecutionState::Scheduled,
            // Until claimed, an activity lives no longer than its workflow.
            deadline: parent_deadline,
            start_to_close: Some(Duration::from_millis(req.start_to_close_timeout_ms)),
            workflow_id: req.workflow_id.clone(),
            workflow_run_id: req.run_id.clone(),
            next_activity: 0,
            value: None,
            failure: None,
            closed_at: None,
        };
        state.enqueue(&req.task_queue, exec.token());
        state.activities.insert(activity_id.clone(), exec);
        drop(state);

        self.emit(EngineEvent::Scheduled {
            task_queue: req.task_queue.clone(),
            kind: ExecutionKind::Activity,
        });
        debug!(self.logger, "Activity scheduled";
            "activity_id" => &activity_id,
            "activity_type" => &req.activity_type,
            "workflow_id" => &req.workflow_id
        );

        Ok(ScheduleActivityResponse { activity_id })
    }

    /// Claim the oldest scheduled task on a queue, waiting up to the requested
    /// time for one to arrive. Returns `None` when the wait elapses.
    pub async fn poll_task(&self, req: PollTaskRequest) -> Result<Option<Task>, EngineError> {
        validate_task_queue(&req.task_queue)?;
        let until = self.long_poll_until(Duration::from_millis(req.wait_ms));

        loop {
            self.ensure_running()?;
            let mut events = self.events.subscribe();

            if let Some(task) = self.try_claim(&req.task_queue, req.kind) {
                debug!(self.logger, "Task claimed";
                    "kind" => task.token.kind.as_str(),
                    "id" => &task.token.id,
                    "type" => &task.type_name,
                    "worker" => &req.identity
                );
                return Ok(Some(task));
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(EngineError::ShuttingDown),
                _ = tokio::time::sleep_until(until) => return Ok(None),
                _ = next_scheduled(&mut events, &req.task_queue, req.kind) => {}
            }
        }
    }

    fn long_poll_until(&self, wait: Duration) -> Instant {
        let now = Instant::now();
        now.checked_add(wait.min(self.options.max_long_poll))
            .unwrap_or(now)
    }

    fn try_claim(&self, task_queue: &str, kind: Option<ExecutionKind>) -> Option<Task> {
        let now = Instant::now();
        let mut state = self.state.lock();

        loop {
            let token = state.queues.get_mut(task_queue)?.pop(kind)?;
            let exec = match state.lookup(token.kind, &token.id, Some(&token.run_id)) {
                Ok(exec) => exec,
                Err(_) => continue,
            };
            if exec.state != ExecutionState::Scheduled {
                continue;
            }
            if exec.expire(now) {
                self.emit_closed(exec);
                continue;
            }
            if exec.claim(now).is_err() {
                continue;
            }
            return Some(exec.to_task(now));
        }
    }

    /// Record the outcome a worker reports for a claimed task
    pub fn complete_task(&self, req: CompleteTaskRequest) -> Result<(), EngineError> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let exec = state.lookup(req.token.kind, &req.token.id, Some(&req.token.run_id))?;
        if exec.expire(now) {
            self.emit_closed(exec);
            return Err(EngineError::AlreadyClosed {
                kind: exec.kind,
                id: exec.id.clone(),
                state: exec.state,
            });
        }

        let outcome_state = req.outcome.state();
        exec.close(req.outcome, now)?;
        self.emit_closed(exec);

        match outcome_state {
            ExecutionState::Completed => debug!(self.logger, "Execution completed";
                "kind" => exec.kind.as_str(), "id" => &exec.id),
            _ => warn!(self.logger, "Execution did not complete";
                "kind" => exec.kind.as_str(),
                "id" => &exec.id,
                "state" => exec.state.as_str()
            ),
        }
        Ok(())
    }

    /// Wait until an execution closes, its deadline passes or the requested
    /// wait elapses, and return its current snapshot.
    pub async fn await_result(
        &self,
        kind: ExecutionKind,
        query: ResultQuery,
    ) -> Result<ExecutionResult, EngineError> {
        let until = self.long_poll_until(
            query
                .wait_ms
                .map(Duration::from_millis)
                .unwrap_or(self.options.max_long_poll),
        );

        loop {
            let mut events = self.events.subscribe();

            let (snapshot, deadline) = {
                let now = Instant::now();
                let mut state = self.state.lock();
                let exec = state.lookup(kind, &query.id, query.run_id.as_deref())?;
                if exec.expire(now) {
                    self.emit_closed(exec);
                }
                (exec.snapshot(), exec.deadline)
            };

            if snapshot.state.is_terminal() || Instant::now() >= until {
                return Ok(snapshot);
            }

            let wake_at = deadline.map_or(until, |deadline| deadline.min(until));
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(EngineError::ShuttingDown),
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = next_closed(&mut events, kind, &query.id) => {}
            }
        }
    }

    /// Time out every overdue execution, drop closed ones past retention and
    /// clear queue tokens that can no longer be claimed. Returns the number
    /// of executions timed out.
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let retention = self.options.retention;
        let mut expired = 0;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        for table in [&mut state.workflows, &mut state.activities] {
            for exec in table.values_mut() {
                if exec.expire(now) {
                    expired += 1;
                    self.emit_closed(exec);
                }
            }
            table.retain(|_, exec| {
                exec.closed_at
                    .map_or(true, |closed_at| now.saturating_duration_since(closed_at) < retention)
            });
        }

        let purged = state.purge_queues();
        if purged > 0 {
            debug!(self.logger, "Dropped stale queue tokens"; "count" => purged);
        }
        expired
    }

    /// Sweep overdue executions until shutdown
    pub async fn run_reaper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.options.reap_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.expire_overdue();
                    if expired > 0 {
                        debug!(self.logger, "Timed out overdue executions"; "count" => expired);
                    }
                }
            }
        }
    }
}

async fn next_scheduled(
    events: &mut broadcast::Receiver<EngineEvent>,
    task_queue: &str,
    wanted: Option<ExecutionKind>,
) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::Scheduled { task_queue: queue, kind })
                if queue == task_queue && wanted.map_or(true, |wanted| wanted == kind) =>
            {
                return
            }
            Ok(_) => {}
            // Missed events: let the caller re-check the queue.
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

async fn next_closed(events: &mut broadcast::Receiver<EngineEvent>, kind: ExecutionKind, id: &str) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::Closed { kind: k, id: closed }) if k == kind && closed == id => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use serde_json::json;

    const QUEUE: &str = "TEST_QUEUE";

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::new(
            EngineOptions::default(),
            CancellationToken::new(),
            logging::discard(),
        ))
    }

    fn start_request(id: &str, timeout_ms: u64) -> StartWorkflowRequest {
        StartWorkflowRequest {
            workflow_id: id.to_string(),
            workflow_type: "GreetingWorkflow".to_string(),
            task_queue: QUEUE.to_string(),
            input: json!(["World"]),
            execution_timeout_ms: timeout_ms,
            conflict_policy: WorkflowIdConflictPolicy::Fail,
            identity: "test".to_string(),
        }
    }

    fn poll_request(wait_ms: u64) -> PollTaskRequest {
        PollTaskRequest {
            task_queue: QUEUE.to_string(),
            identity: "worker".to_string(),
            wait_ms,
            kind: None,
        }
    }

    fn result_query(id: &str, wait_ms: u64) -> ResultQuery {
        ResultQuery {
            id: id.to_string(),
            run_id: None,
            wait_ms: Some(wait_ms),
        }
    }

    #[tokio::test]
    async fn test_start_claim_complete_roundtrip() {
        let engine = engine();
        let started = engine.start_workflow(start_request("wf-1", 5_000)).unwrap();
        assert!(!started.attached);

        let task = engine.poll_task(poll_request(100)).await.unwrap().unwrap();
        assert_eq!(task.token.kind, ExecutionKind::Workflow);
        assert_eq!(task.token.run_id, started.run_id);
        assert_eq!(task.input, json!(["World"]));

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .await_result(ExecutionKind::Workflow, result_query("wf-1", 5_000))
                    .await
            })
        };

        engine
            .complete_task(CompleteTaskRequest {
                token: task.token,
                outcome: TaskOutcome::Completed {
                    value: json!("Hello World!"),
                },
            })
            .unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.state, ExecutionState::Completed);
        assert_eq!(result.value, Some(json!("Hello World!")));
        assert!(result.failure.is_none());
    }

    #[tokio::test]
    async fn test_unclaimed_workflow_times_out() {
        let engine = engine();
        engine.start_workflow(start_request("lonely", 50)).unwrap();

        let result = engine
            .await_result(ExecutionKind::Workflow, result_query("lonely", 5_000))
            .await
            .unwrap();
        assert_eq!(result.state, ExecutionState::TimedOut);
        assert!(result.value.is_none());
        assert_eq!(
            result.failure.map(|f| f.kind),
            Some(crate::engine::state::FailureKind::TimedOut)
        );

        // The timed out task is never handed to a worker.
        assert!(engine.poll_task(poll_request(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflict_policies() {
        let engine = engine();
        let first = engine.start_workflow(start_request("dup", 5_000)).unwrap();

        match engine.start_workflow(start_request("dup", 5_000)) {
            Err(EngineError::AlreadyStarted { run_id, .. }) => assert_eq!(run_id, first.run_id),
            other => panic!("expected AlreadyStarted, got {:?}", other),
        }

        let mut attach = start_request("dup", 5_000);
        attach.conflict_policy = WorkflowIdConflictPolicy::UseExisting;
        let attached = engine.start_workflow(attach).unwrap();
        assert!(attached.attached);
        assert_eq!(attached.run_id, first.run_id);
    }

    #[tokio::test]
    async fn test_closed_run_allows_id_reuse() {
        let engine = engine();
        let first = engine.start_workflow(start_request("reuse", 5_000)).unwrap();
        let task = engine.poll_task(poll_request(100)).await.unwrap().unwrap();
        engine
            .complete_task(CompleteTaskRequest {
                token: task.token,
                outcome: TaskOutcome::Failed {
                    failure: Failure::application("boom"),
                },
            })
            .unwrap();

        let second = engine.start_workflow(start_request("reuse", 5_000)).unwrap();
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn test_late_completion_is_rejected() {
        let engine = engine();
        engine.start_workflow(start_request("slow", 50)).unwrap();
        let task = engine.poll_task(poll_request(100)).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let err = engine
            .complete_task(CompleteTaskRequest {
                token: task.token,
                outcome: TaskOutcome::Completed { value: json!(1) },
            })
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::AlreadyClosed {
                state: ExecutionState::TimedOut,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_activity_requires_running_parent() {
        let engine = engine();
        let started = engine.start_workflow(start_request("parent", 5_000)).unwrap();
        let activity = ScheduleActivityRequest {
            workflow_id: "parent".to_string(),
            run_id: started.run_id.clone(),
            activity_type: "ComposeGreeting".to_string(),
            task_queue: QUEUE.to_string(),
            input: json!(["World"]),
            start_to_close_timeout_ms: 1_000,
        };

        // Not claimed yet.
        assert!(engine.schedule_activity(activity.clone()).is_err());

        let _workflow_task = engine.poll_task(poll_request(100)).await.unwrap().unwrap();
        let scheduled = engine.schedule_activity(activity).unwrap();
        assert_eq!(scheduled.activity_id, format!("{}/activity-1", started.run_id));

        let task = engine.poll_task(poll_request(100)).await.unwrap().unwrap();
        assert_eq!(task.token.kind, ExecutionKind::Activity);
        assert_eq!(task.type_name, "ComposeGreeting");
        assert_eq!(task.workflow_id, "parent");
        assert!(task.deadline_ms.unwrap() <= 1_000);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_new_task() {
        let engine = engine();
        let poller = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.poll_task(poll_request(5_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        engine.start_workflow(start_request("later", 5_000)).unwrap();
        let task = tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .expect("poll should wake up")
            .unwrap()
            .unwrap();
        assert_eq!(task.unwrap().token.id, "later");
    }

    #[tokio::test]
    async fn test_shutdown_ends_long_polls() {
        let shutdown = CancellationToken::new();
        let engine = Arc::new(Engine::new(
            EngineOptions::default(),
            shutdown.clone(),
            logging::discard(),
        ));
        let poller = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.poll_task(poll_request(30_000)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err(), EngineError::ShuttingDown);
        assert_eq!(
            engine.start_workflow(start_request("after", 1_000)).unwrap_err(),
            EngineError::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_poll_by_kind() {
        let engine = engine();
        let started = engine.start_workflow(start_request("kinds", 5_000)).unwrap();
        let workflow_task = engine.poll_task(poll_request(100)).await.unwrap().unwrap();
        assert_eq!(workflow_task.token.kind, ExecutionKind::Workflow);

        engine.start_workflow(start_request("queued", 5_000)).unwrap();
        engine
            .schedule_activity(ScheduleActivityRequest {
                workflow_id: "kinds".to_string(),
                run_id: started.run_id,
                activity_type: "ComposeGreeting".to_string(),
                task_queue: QUEUE.to_string(),
                input: json!("World"),
                start_to_close_timeout_ms: 1_000,
            })
            .unwrap();

        let activity_poll = PollTaskRequest {
            kind: Some(ExecutionKind::Activity),
            ..poll_request(100)
        };
        let task = engine.poll_task(activity_poll.clone()).await.unwrap().unwrap();
        assert_eq!(task.token.kind, ExecutionKind::Activity);
        // The queued workflow is not handed to an activity poller.
        assert!(engine.poll_task(activity_poll).await.unwrap().is_none());

        let workflow_poll = PollTaskRequest {
            kind: Some(ExecutionKind::Workflow),
            ..poll_request(100)
        };
        let task = engine.poll_task(workflow_poll).await.unwrap().unwrap();
        assert_eq!(task.token.id, "queued");
    }

    #[tokio::test]
    async fn test_reaper_clears_unclaimed_tokens() {
        let options = EngineOptions {
            retention: Duration::from_millis(1),
            ..EngineOptions::default()
        };
        let engine = Engine::new(options, CancellationToken::new(), logging::discard());
        for i in 0..1000 {
            let mut request = start_request(&format!("nobody-{}", i), 1);
            request.task_queue = "NOBODY".to_string();
            engine.start_workflow(request).unwrap();
        }
        assert_eq!(engine.state.lock().queued_tokens(), 1000);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.expire_overdue(), 1000);
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.expire_overdue();

        let state = engine.state.lock();
        assert!(state.workflows.is_empty());
        assert_eq!(state.queued_tokens(), 0);
        assert!(state.queues.is_empty());
    }

    #[tokio::test]
    async fn test_huge_timeouts_do_not_overflow() {
        let options = EngineOptions {
            max_long_poll: Duration::from_millis(50),
            ..EngineOptions::default()
        };
        let engine = Engine::new(options, CancellationToken::new(), logging::discard());
        let started = engine
            .start_workflow(start_request("forever", u64::MAX))
            .unwrap();
        let task = engine.poll_task(poll_request(100)).await.unwrap().unwrap();
        assert_eq!(task.token.run_id, started.run_id);

        engine
            .schedule_activity(ScheduleActivityRequest {
                workflow_id: "forever".to_string(),
                run_id: started.run_id,
                activity_type: "ComposeGreeting".to_string(),
                task_queue: QUEUE.to_string(),
                input: json!("World"),
                start_to_close_timeout_ms: u64::MAX,
            })
            .unwrap();
        let activity = engine.poll_task(poll_request(100)).await.unwrap().unwrap();
        assert_eq!(activity.token.kind, ExecutionKind::Activity);

        // The wait is capped by the long-poll limit.
        let result = engine
            .await_result(
                ExecutionKind::Workflow,
                ResultQuery {
                    id: "forever".to_string(),
                    run_id: None,
                    wait_ms: Some(u64::MAX),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.state, ExecutionState::Running);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_reaper_sweeps_and_retains() {
        let options = EngineOptions {
            retention: Duration::from_millis(50),
            ..EngineOptions::default()
        };
        let engine = Engine::new(options, CancellationToken::new(), logging::discard());
        engine.start_workflow(start_request("swept", 10)).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.expire_overdue(), 1);
        assert_eq!(engine.expire_overdue(), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        engine.expire_overdue();
        let err = engine
            .await_result(ExecutionKind::Workflow, result_query("swept", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
