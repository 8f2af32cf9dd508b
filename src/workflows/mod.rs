//! Workflows and activities bundled with every node

use crate::client::{ClientError, WorkflowClient, WorkflowInvocation};
use crate::engine::WorkflowIdConflictPolicy;
use crate::instance::{host_interfaces, InstanceSource, InstanceState};
use crate::roles::ClientTask;
use crate::worker::{ActivityContext, ActivityOptions, Registry, WorkflowContext, WorkflowError};
use serde::{Deserialize, Serialize};
use slog::{debug, info, Logger};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const GREETING_WORKFLOW: &str = "GreetingWorkflow";
pub const COMPOSE_GREETING: &str = "ComposeGreeting";
pub const GET_INSTANCE_STATE_WORKFLOW: &str = "GetInstanceStateWorkflow";
pub const GET_INSTANCE_STATE: &str = "GetInstanceState";

/// Workflow ID used by the greeting each client role runs at startup
pub const GREETING_WORKFLOW_ID: &str = "greeting-workflow";

const COMPOSE_GREETING_TIMEOUT: Duration = Duration::from_secs(5);
const GET_INSTANCE_STATE_TIMEOUT: Duration = Duration::from_secs(15);
const GREETING_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Input of `GetInstanceStateWorkflow` and its activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRef {
    pub project: String,
    pub instance: String,
}

pub async fn greeting_workflow(
    name: String,
    ctx: WorkflowContext,
) -> Result<String, WorkflowError> {
    ctx.execute_activity(
        COMPOSE_GREETING,
        name,
        ActivityOptions::with_start_to_close(COMPOSE_GREETING_TIMEOUT),
    )
    .await
}

pub async fn compose_greeting(name: String, _ctx: ActivityContext) -> Result<String, WorkflowError> {
    Ok(format!("Hello {}!", name))
}

pub async fn get_instance_state_workflow(
    target: InstanceRef,
    ctx: WorkflowContext,
) -> Result<InstanceState, WorkflowError> {
    ctx.execute_activity(
        GET_INSTANCE_STATE,
        target,
        ActivityOptions::with_start_to_close(GET_INSTANCE_STATE_TIMEOUT),
    )
    .await
}

/// Registry with the greeting workflow and its activity
pub fn default_registry() -> Result<Registry, WorkflowError> {
    let mut registry = Registry::new();
    registry.register_workflow(GREETING_WORKFLOW, greeting_workflow)?;
    registry.register_activity(COMPOSE_GREETING, compose_greeting)?;
    Ok(registry)
}

/// Add `GetInstanceStateWorkflow` and its activity, backed by `instances`
pub fn register_instance_state(
    registry: &mut Registry,
    instances: Arc<dyn InstanceSource>,
) -> Result<(), WorkflowError> {
    registry.register_workflow(GET_INSTANCE_STATE_WORKFLOW, get_instance_state_workflow)?;
    registry.register_activity(
        GET_INSTANCE_STATE,
        move |target: InstanceRef, ctx: ActivityContext| {
            let instances = instances.clone();
            async move {
                let instance = instances
                    .load_instance(&target.project, &target.instance)
                    .await
                    .map_err(|e| WorkflowError::application(e.to_string()))?;
                let interfaces = tokio::task::spawn_blocking(host_interfaces)
                    .await
                    .unwrap_or_default();
                debug!(ctx.logger(), "Rendering instance state";
                    "project" => instance.project(),
                    "instance" => instance.name(),
                    "host_interfaces" => interfaces.len()
                );
                instance
                    .render_state(&interfaces)
                    .map_err(|e| WorkflowError::application(e.to_string()))
            }
        },
    )
}

/// Client task that runs the greeting workflow once and logs its result
pub fn greeting_client_task(identity: String, task_queue: String) -> ClientTask {
    ClientTask::new(move |client: WorkflowClient, logger: Logger| async move {
        let invocation = WorkflowInvocation::new(
            GREETING_WORKFLOW_ID,
            GREETING_WORKFLOW,
            task_queue,
            format!("World (from {})", identity),
        )
        .with_timeout(GREETING_EXECUTION_TIMEOUT)
        .with_conflict_policy(WorkflowIdConflictPolicy::UseExisting);

        let run = client.start(&invocation).await?;
        let result: String = run.get(invocation.timeout).await?;
        info!(logger, "Greeting workflow finished";
            "WorkflowID" => run.workflow_id(),
            "RunID" => run.run_id(),
            "Result" => &result
        );
        Ok::<(), ClientError>(())
    })
}

/// Fetch the state of an instance through `GetInstanceStateWorkflow`.
///
/// Each call runs under its own workflow ID, so concurrent lookups never
/// collide.
pub async fn get_instance_state(
    client: &WorkflowClient,
    task_queue: &str,
    project: &str,
    instance: &str,
    timeout: Duration,
) -> Result<InstanceState, ClientError> {
    let invocation = WorkflowInvocation::new(
        format!("get-instance-state-{}", Uuid::new_v4()),
        GET_INSTANCE_STATE_WORKFLOW,
        task_queue,
        InstanceRef {
            project: project.to_string(),
            instance: instance.to_string(),
        },
    )
    .with_timeout(timeout);
    client.execute(invocation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::MemoryInstanceSource;
    use crate::logging;

    #[tokio::test]
    async fn test_compose_greeting() {
        let ctx = ActivityContext::new(
            "run/activity-1".to_string(),
            COMPOSE_GREETING.to_string(),
            GREETING_WORKFLOW_ID.to_string(),
            "QUEUE".to_string(),
            None,
            logging::discard(),
        );
        assert_eq!(
            compose_greeting("World".to_string(), ctx).await.unwrap(),
            "Hello World!"
        );
    }

    #[test]
    fn test_registries() {
        let mut registry = default_registry().unwrap();
        assert_eq!(registry.workflow_names(), vec![GREETING_WORKFLOW]);
        assert_eq!(registry.activity_names(), vec![COMPOSE_GREETING]);

        register_instance_state(&mut registry, Arc::new(MemoryInstanceSource::new())).unwrap();
        assert!(registry.has_workflow(GET_INSTANCE_STATE_WORKFLOW));
        assert!(registry.has_activity(GET_INSTANCE_STATE));

        // A second registration of the same names is refused.
        let err = register_instance_state(&mut registry, Arc::new(MemoryInstanceSource::new()))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyRegistered(_)));
    }
}
