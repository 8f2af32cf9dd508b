//! Bootstrap orchestrator: starts the roles, wires the readiness gate and
//! owns the shutdown join.

use crate::bootstrap::barrier::JoinBarrier;
use crate::bootstrap::gate::ReadinessGate;
use crate::bootstrap::role::{Role, RoleContext, RoleError, RoleExit, RoleKind, RoleRunner};
use crate::client::{SharedConnection, WorkflowClient};
use crate::config::{ConfigError, NodeConfig};
use crate::instance::InstanceSource;
use crate::roles::{ClientRole, CoordinatorRole, WorkerRole};
use crate::workflows;
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by the orchestrator
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The coordinator failed; no dependent role can make progress
    #[error("coordinator '{name}' failed: {source}")]
    CoordinatorFailed {
        name: String,
        #[source]
        source: RoleError,
    },

    /// The role passed as coordinator is of another kind
    #[error("expected a coordinator role, got a {0} role")]
    NotACoordinator(RoleKind),

    /// More than one coordinator role was supplied
    #[error("only one coordinator role may be started")]
    DuplicateCoordinator,

    /// A required role kind is missing
    #[error("at least one {0} role is required")]
    MissingRole(RoleKind),

    /// Shutdown fired before the coordinator signaled readiness
    #[error("bootstrap stopped before the coordinator became ready")]
    NotReady,

    /// Roles were still running when the shutdown grace period elapsed
    #[error("{outstanding} role(s) still running {grace:?} after shutdown")]
    ShutdownTimedOut { grace: Duration, outstanding: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Outcome of every role after a clean join
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub roles: Vec<RoleExit>,
}

impl ShutdownReport {
    /// Roles that exited with an error without aborting the bootstrap
    pub fn failures(&self) -> impl Iterator<Item = &RoleExit> {
        self.roles.iter().filter(|exit| exit.outcome.is_err())
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// A set of roles ready to be started.
///
/// Exactly one coordinator is taken at construction; workers and clients are
/// added with [`Bootstrap::with_role`].
pub struct Bootstrap {
    coordinator: Box<dyn Role>,
    dependents: Vec<Box<dyn Role>>,
    readiness_timeout: Option<Duration>,
    logger: Logger,
}

impl Bootstrap {
    pub fn new(coordinator: impl Role, logger: Logger) -> Self {
        Self {
            coordinator: Box::new(coordinator),
            dependents: Vec::new(),
            readiness_timeout: None,
            logger,
        }
    }

    /// Add a worker or client role
    pub fn with_role(mut self, role: impl Role) -> Self {
        self.dependents.push(Box::new(role));
        self
    }

    /// Bound how long dependent roles wait for the coordinator
    pub fn with_readiness_timeout(mut self, limit: Duration) -> Self {
        self.readiness_timeout = Some(limit);
        self
    }

    /// Assemble the standard node: one coordinator, one worker serving the
    /// bundled workflows and one client running the greeting workflow.
    ///
    /// The returned [`WorkflowClient`] shares the client role's connection and
    /// reports `NotConnected` until that role has dialed the coordinator.
    pub fn standard(
        config: &NodeConfig,
        logger: Logger,
        instances: Option<Arc<dyn InstanceSource>>,
    ) -> Result<(Self, WorkflowClient), BootstrapError> {
        config.validate()?;

        let identity = config.identity();
        let frontend = config.frontend_address()?;
        let host_port = frontend.to_string();

        info!(logger, "Assembling node";
            "node_id" => config.node_id,
            "cluster_id" => %config.cluster_id,
            "frontend" => %frontend,
            "task_queue" => &config.task_queue
        );

        let coordinator = CoordinatorRole::new(identity.clone(), frontend, config.cluster_id)
            .with_engine_options(config.engine.clone());

        let mut registry =
            workflows::default_registry().map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if let Some(instances) = instances {
            workflows::register_instance_state(&mut registry, instances)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        let worker = WorkerRole::new(
            identity.clone(),
            host_port.clone(),
            config.task_queue.clone(),
            registry,
        )
        .with_options(config.worker.clone())
        .with_dial_options(config.dial.clone());

        let connection = SharedConnection::new();
        let client = ClientRole::new(identity.clone(), host_port, connection.clone())
            .with_dial_options(config.dial.clone())
            .with_task(workflows::greeting_client_task(
                identity.clone(),
                config.task_queue.clone(),
            ));

        let mut bootstrap = Bootstrap::new(coordinator, logger)
            .with_role(worker)
            .with_role(client);
        if let Some(limit) = config.readiness_timeout {
            bootstrap = bootstrap.with_readiness_timeout(limit);
        }

        Ok((bootstrap, WorkflowClient::new(identity, connection)))
    }

    /// Launch every role concurrently and return without waiting on them.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Result<BootstrapHandle, BootstrapError> {
        let kind = self.coordinator.kind();
        if kind != RoleKind::Coordinator {
            return Err(BootstrapError::NotACoordinator(kind));
        }
        if self
            .dependents
            .iter()
            .any(|role| role.kind() == RoleKind::Coordinator)
        {
            return Err(BootstrapError::DuplicateCoordinator);
        }
        for required in [RoleKind::Worker, RoleKind::Client] {
            if !self.dependents.iter().any(|role| role.kind() == required) {
                return Err(BootstrapError::MissingRole(required));
            }
        }

        let gate = ReadinessGate::new();
        let shutdown = CancellationToken::new();
        let barrier = JoinBarrier::new();
        let ctx = RoleContext::new(gate.clone(), shutdown.clone(), self.logger.clone());

        let mut tasks = JoinSet::new();
        let roles = std::iter::once(self.coordinator).chain(self.dependents);
        for role in roles {
            debug!(self.logger, "Launching role"; "kind" => role.kind().as_str(), "name" => role.name());
            let runner = RoleRunner::new(role, ctx.clone(), self.readiness_timeout);
            let guard = barrier.enter();
            tasks.spawn(runner.run(guard));
        }

        info!(self.logger, "Bootstrap started"; "roles" => barrier.outstanding());

        Ok(BootstrapHandle {
            gate,
            shutdown,
            barrier,
            tasks,
            logger: self.logger.new(o!("component" => "bootstrap")),
        })
    }
}

/// Handle to a running bootstrap
pub struct BootstrapHandle {
    gate: ReadinessGate,
    shutdown: CancellationToken,
    barrier: JoinBarrier,
    tasks: JoinSet<RoleExit>,
    logger: Logger,
}

impl BootstrapHandle {
    pub fn gate(&self) -> &ReadinessGate {
        &self.gate
    }

    /// A clone of the shared cancellation token
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of roles that have not exited yet
    pub fn outstanding(&self) -> usize {
        self.barrier.outstanding()
    }

    /// Wait until the coordinator is ready.
    ///
    /// Fails with [`BootstrapError::NotReady`] if shutdown fires first, which
    /// is also what happens when the coordinator fails to initialize; `join`
    /// then reports the underlying error.
    pub async fn ready(&self) -> Result<(), BootstrapError> {
        tokio::select! {
            biased;
            _ = self.gate.wait() => Ok(()),
            _ = self.shutdown.cancelled() => {
                if self.gate.is_signaled() {
                    Ok(())
                } else {
                    Err(BootstrapError::NotReady)
                }
            }
        }
    }

    /// Fire the shared cancellation token. Later calls are no-ops.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(self.logger, "Shutdown requested");
        }
        self.shutdown.cancel();
    }

    /// Wait for every role to exit
    pub async fn join(mut self) -> Result<ShutdownReport, BootstrapError> {
        self.barrier.wait().await;
        self.collect().await
    }

    /// Like [`join`](Self::join), but abort roles still running `grace` after
    /// shutdown has been requested.
    pub async fn join_with_grace(mut self, grace: Duration) -> Result<ShutdownReport, BootstrapError> {
        let shutdown = self.shutdown.clone();
        let barrier = self.barrier.clone();
        let bounded = async move {
            shutdown.cancelled().await;
            tokio::time::timeout(grace, barrier.wait()).await
        };

        let timed_out = tokio::select! {
            _ = self.barrier.wait() => false,
            waited = bounded => waited.is_err(),
        };

        if timed_out {
            let outstanding = self.barrier.outstanding();
            warn!(self.logger, "Roles did not stop in time, aborting";
                "outstanding" => outstanding,
                "grace_ms" => grace.as_millis() as u64
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
            return Err(BootstrapError::ShutdownTimedOut { grace, outstanding });
        }

        self.collect().await
    }

    async fn collect(&mut self) -> Result<ShutdownReport, BootstrapError> {
        let mut report = ShutdownReport::default();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(exit) => report.roles.push(exit),
                Err(e) => warn!(self.logger, "Role task did not complete"; "error" => %e),
            }
        }

        let failed_coordinator = report
            .roles
            .iter()
            .position(|exit| exit.kind == RoleKind::Coordinator && exit.outcome.is_err());
        if let Some(index) = failed_coordinator {
            let exit = report.roles.swap_remove(index);
            if let Err(source) = exit.outcome {
                return Err(BootstrapError::CoordinatorFailed {
                    name: exit.name,
                    source,
                });
            }
        }

        info!(self.logger, "Shutdown complete";
            "roles" => report.roles.len(),
            "failures" => report.failures().count()
        );
        Ok(report)
    }
}
