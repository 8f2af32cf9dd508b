use crate::bootstrap::{Role, RoleContext, RoleError, RoleKind};
use crate::client::{ClientError, DialOptions, SharedConnection, WorkflowClient};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use slog::{info, warn, Logger};
use std::future::Future;

/// Work a client role performs once it is connected
pub struct ClientTask {
    run: Box<dyn FnOnce(WorkflowClient, Logger) -> BoxFuture<'static, Result<(), ClientError>> + Send>,
}

impl ClientTask {
    pub fn new<F, Fut>(task: F) -> Self
    where
        F: FnOnce(WorkflowClient, Logger) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        Self {
            run: Box::new(move |client, logger| task(client, logger).boxed()),
        }
    }

    async fn run(self, client: WorkflowClient, logger: Logger) -> Result<(), ClientError> {
        (self.run)(client, logger).await
    }
}

/// Publishes the shared connection and runs an optional task.
///
/// The task's failure is logged and the role keeps running until shutdown,
/// so a bad invocation never takes other roles down.
pub struct ClientRole {
    identity: String,
    host_port: String,
    connection: SharedConnection,
    dial: DialOptions,
    task: Option<ClientTask>,
}

impl ClientRole {
    pub fn new(identity: String, host_port: String, connection: SharedConnection) -> Self {
        Self {
            identity,
            host_port,
            connection,
            dial: DialOptions::default(),
            task: None,
        }
    }

    pub fn with_dial_options(mut self, dial: DialOptions) -> Self {
        self.dial = dial;
        self
    }

    pub fn with_task(mut self, task: ClientTask) -> Self {
        self.task = Some(task);
        self
    }
}

#[async_trait]
impl Role for ClientRole {
    fn name(&self) -> String {
        self.identity.clone()
    }

    fn kind(&self) -> RoleKind {
        RoleKind::Client
    }

    async fn run(self: Box<Self>, ctx: RoleContext) -> Result<(), RoleError> {
        let this = *self;
        let logger = ctx.logger().clone();
        let shutdown = ctx.shutdown().clone();

        let connection = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            dialed = this.connection.get_or_dial(&this.identity, &this.host_port, &this.dial) => dialed?,
        };
        info!(logger, "Client connected";
            "host_port" => connection.host_port(),
            "cluster_id" => %connection.cluster_id()
        );

        if let Some(task) = this.task {
            let client = WorkflowClient::new(this.identity, this.connection);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                finished = task.run(client, logger.clone()) => {
                    if let Err(e) = finished {
                        warn!(logger, "Client task failed"; "error" => %e);
                    }
                }
            }
        }

        shutdown.cancelled().await;
        Ok(())
    }
}
