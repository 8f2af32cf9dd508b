use crate::worker::context::{ActivityContext, WorkflowContext};
use crate::worker::error::WorkflowError;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A workflow or activity function with its input and output erased to JSON
pub struct BoxedFunction<C> {
    executor: Box<dyn Fn(serde_json::Value, C) -> BoxFuture<'static, Result<serde_json::Value, WorkflowError>> + Send + Sync>,
}

impl<C: Send + 'static> BoxedFunction<C> {
    /// Wrap a typed closure taking `(input, context)`
    pub fn new<I, O, F, Fut>(function: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + Send + 'static,
    {
        let function = Arc::new(function);
        let executor = Box::new(move |input: serde_json::Value, context: C| {
            let function = function.clone();
            Box::pin(async move {
                let input: I = serde_json::from_value(input)
                    .map_err(|e| WorkflowError::Deserialization(e.to_string()))?;
                let output = function(input, context).await?;
                serde_json::to_value(output).map_err(|e| WorkflowError::Serialization(e.to_string()))
            }) as BoxFuture<'static, Result<serde_json::Value, WorkflowError>>
        });

        BoxedFunction { executor }
    }

    pub async fn execute(
        &self,
        input: serde_json::Value,
        context: C,
    ) -> Result<serde_json::Value, WorkflowError> {
        (self.executor)(input, context).await
    }
}

/// Workflow and activity functions a worker can run, keyed by type name.
///
/// The registry is filled before the worker starts and never changes once
/// the worker owns it.
#[derive(Default)]
pub struct Registry {
    workflows: HashMap<String, Arc<BoxedFunction<WorkflowContext>>>,
    activities: HashMap<String, Arc<BoxedFunction<ActivityContext>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow function under `workflow_type`
    ///
    /// # Returns
    /// * `Err(WorkflowError::AlreadyRegistered)` if the name is taken
    pub fn register_workflow<I, O, F, Fut>(
        &mut self,
        workflow_type: &str,
        function: F,
    ) -> Result<(), WorkflowError>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + Send + 'static,
    {
        if self.workflows.contains_key(workflow_type) {
            return Err(WorkflowError::AlreadyRegistered(workflow_type.to_string()));
        }
        self.workflows
            .insert(workflow_type.to_string(), Arc::new(BoxedFunction::new(function)));
        Ok(())
    }

    /// Register an activity function under `activity_type`
    pub fn register_activity<I, O, F, Fut>(
        &mut self,
        activity_type: &str,
        function: F,
    ) -> Result<(), WorkflowError>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, ActivityContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + Send + 'static,
    {
        if self.activities.contains_key(activity_type) {
            return Err(WorkflowError::AlreadyRegistered(activity_type.to_string()));
        }
        self.activities
            .insert(activity_type.to_string(), Arc::new(BoxedFunction::new(function)));
        Ok(())
    }

    pub fn workflow(&self, workflow_type: &str) -> Option<Arc<BoxedFunction<WorkflowContext>>> {
        self.workflows.get(workflow_type).cloned()
    }

    pub fn activity(&self, activity_type: &str) -> Option<Arc<BoxedFunction<ActivityContext>>> {
        self.activities.get(activity_type).cloned()
    }

    pub fn has_workflow(&self, workflow_type: &str) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    pub fn has_activity(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    /// Registered workflow names, sorted
    pub fn workflow_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered activity names, sorted
    pub fn activity_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.activities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty() && self.activities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;
    use serde_json::json;

    fn activity_context() -> ActivityContext {
        ActivityContext::new(
            "run/activity-1".to_string(),
            "Double".to_string(),
            "wf".to_string(),
            "QUEUE".to_string(),
            None,
            logging::discard(),
        )
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut registry = Registry::new();
        assert!(registry.is_empty());

        registry
            .register_activity("Double", |x: i64, _ctx: ActivityContext| async move {
                Ok::<i64, WorkflowError>(x * 2)
            })
            .unwrap();
        let err = registry
            .register_activity("Double", |x: i64, _ctx: ActivityContext| async move {
                Ok::<i64, WorkflowError>(x)
            })
            .unwrap_err();
        assert_eq!(err, WorkflowError::AlreadyRegistered("Double".to_string()));

        // Workflows and activities live in separate namespaces.
        registry
            .register_workflow("Double", |x: i64, _ctx: WorkflowContext| async move {
                Ok::<i64, WorkflowError>(x)
            })
            .unwrap();
        assert!(registry.has_workflow("Double"));
        assert_eq!(registry.activity_names(), vec!["Double"]);
    }

    #[tokio::test]
    async fn test_boxed_function_decodes_and_encodes_json() {
        let mut registry = Registry::new();
        registry
            .register_activity("Double", |x: i64, _ctx: ActivityContext| async move {
                Ok::<i64, WorkflowError>(x * 2)
            })
            .unwrap();
        let double = registry.activity("Double").unwrap();

        let output = double.execute(json!(21), activity_context()).await.unwrap();
        assert_eq!(output, json!(42));

        let err = double
            .execute(json!("not a number"), activity_context())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Deserialization(_)));
    }

    #[test]
    fn test_unknown_names() {
        let registry = Registry::new();
        assert!(registry.workflow("Missing").is_none());
        assert!(registry.activity("Missing").is_none());
    }
}
