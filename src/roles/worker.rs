use crate::bootstrap::{Role, RoleContext, RoleError, RoleKind};
use crate::client::{Connection, DialOptions};
use crate::engine::validate_task_queue;
use crate::worker::{Registry, Worker, WorkerOptions};
use async_trait::async_trait;
use slog::info;

/// Connects to the coordinator and serves a registry on one task queue
pub struct WorkerRole {
    identity: String,
    host_port: String,
    task_queue: String,
    registry: Registry,
    options: WorkerOptions,
    dial: DialOptions,
}

impl WorkerRole {
    pub fn new(identity: String, host_port: String, task_queue: String, registry: Registry) -> Self {
        Self {
            identity,
            host_port,
            task_queue,
            registry,
            options: WorkerOptions::default(),
            dial: DialOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_dial_options(mut self, dial: DialOptions) -> Self {
        self.dial = dial;
        self
    }
}

#[async_trait]
impl Role for WorkerRole {
    fn name(&self) -> String {
        self.identity.clone()
    }

    fn kind(&self) -> RoleKind {
        RoleKind::Worker
    }

    async fn run(self: Box<Self>, ctx: RoleContext) -> Result<(), RoleError> {
        let this = *self;
        validate_task_queue(&this.task_queue)
            .map_err(|e| RoleError::Registration(e.to_string()))?;
        if this.registry.is_empty() {
            return Err(RoleError::Registration(
                "no workflows or activities registered".to_string(),
            ));
        }

        let connection = tokio::select! {
            biased;
            _ = ctx.shutdown().cancelled() => return Ok(()),
            dialed = Connection::dial_with(&this.identity, &this.host_port, &this.dial) => dialed?,
        };
        info!(ctx.logger(), "Worker connected";
            "host_port" => &this.host_port,
            "cluster_id" => %connection.cluster_id()
        );

        Worker::new(
            this.identity,
            this.task_queue,
            this.registry,
            connection,
            this.options,
            ctx.logger().clone(),
        )
        .run(ctx.shutdown().clone())
        .await;
        Ok(())
    }
}
