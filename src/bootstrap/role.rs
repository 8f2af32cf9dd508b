//! Role abstraction and the lifecycle wrapper that runs one role.

use crate::bootstrap::barrier::BarrierGuard;
use crate::bootstrap::gate::{GateError, ReadinessGate};
use crate::client::ConnectionError;
use async_trait::async_trait;
use futures::FutureExt;
use slog::{error, info, o, warn, Logger};
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The three kinds of cooperating roles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoleKind {
    Coordinator,
    Worker,
    Client,
}

impl RoleKind {
    /// Whether roles of this kind must wait for the coordinator's readiness gate
    pub fn depends_on_gate(self) -> bool {
        !matches!(self, RoleKind::Coordinator)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoleKind::Coordinator => "coordinator",
            RoleKind::Worker => "worker",
            RoleKind::Client => "client",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors a role can exit with
#[derive(Debug, Error)]
pub enum RoleError {
    /// The coordinator could not bind its listener
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The coordinator's server stopped with an I/O error
    #[error("server error: {0}")]
    Server(#[source] std::io::Error),

    /// A dependent role gave up waiting for the coordinator
    #[error(transparent)]
    NotReady(#[from] GateError),

    /// The role could not reach the coordinator
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Worker registration was rejected
    #[error("registration error: {0}")]
    Registration(String),

    /// The role's future panicked
    #[error("role panicked: {0}")]
    Panicked(String),

    /// The coordinator returned without ever opening the readiness gate
    #[error("coordinator exited before becoming ready")]
    ExitedBeforeReady,
}

/// Shared primitives handed to every role
#[derive(Clone)]
pub struct RoleContext {
    gate: ReadinessGate,
    shutdown: CancellationToken,
    logger: Logger,
}

impl RoleContext {
    pub fn new(gate: ReadinessGate, shutdown: CancellationToken, logger: Logger) -> Self {
        Self {
            gate,
            shutdown,
            logger,
        }
    }

    /// The coordinator's readiness gate
    pub fn gate(&self) -> &ReadinessGate {
        &self.gate
    }

    /// Process-wide cancellation signal; roles only observe it
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    fn with_logger(&self, logger: Logger) -> Self {
        Self {
            gate: self.gate.clone(),
            shutdown: self.shutdown.clone(),
            logger,
        }
    }
}

/// An independently scheduled unit of execution.
///
/// `run` should block until the shutdown token fires (or the role fails) and
/// release its listeners and connections before returning.
#[async_trait]
pub trait Role: Send + 'static {
    /// Human-readable label, e.g. `node1`
    fn name(&self) -> String;

    fn kind(&self) -> RoleKind;

    async fn run(self: Box<Self>, ctx: RoleContext) -> Result<(), RoleError>;
}

/// How a role finished
#[derive(Debug)]
pub struct RoleExit {
    pub name: String,
    pub kind: RoleKind,
    pub outcome: Result<(), RoleError>,
}

/// Runs one role to completion or cancellation and reports to the join barrier.
///
/// Dependent roles are held back until the readiness gate opens, so no
/// worker or client reaches the engine before the coordinator is listening.
/// A failing coordinator fires the shutdown token, releasing every dependent
/// still parked on the gate.
pub struct RoleRunner {
    role: Box<dyn Role>,
    ctx: RoleContext,
    readiness_timeout: Option<Duration>,
}

impl RoleRunner {
    pub fn new(role: Box<dyn Role>, ctx: RoleContext, readiness_timeout: Option<Duration>) -> Self {
        Self {
            role,
            ctx,
            readiness_timeout,
        }
    }

    pub async fn run(self, guard: BarrierGuard) -> RoleExit {
        let _guard = guard;
        let name = self.role.name();
        let kind = self.role.kind();
        let logger = self
            .ctx
            .logger
            .new(o!("role" => kind.as_str(), "identity" => name.clone()));
        let ctx = self.ctx.with_logger(logger.clone());

        if kind.depends_on_gate() {
            match Self::await_gate(&ctx, self.readiness_timeout).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(logger, "Shutdown requested before coordinator became ready");
                    return RoleExit {
                        name,
                        kind,
                        outcome: Ok(()),
                    };
                }
                Err(e) => {
                    warn!(logger, "Coordinator not ready"; "error" => %e);
                    return RoleExit {
                        name,
                        kind,
                        outcome: Err(e.into()),
                    };
                }
            }
        }

        info!(logger, "Role starting");
        let outcome = match AssertUnwindSafe(self.role.run(ctx.clone()))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => Err(RoleError::Panicked(panic_message(panic))),
        };

        // Dependents wait on the gate, so a coordinator that never opened it
        // must not look like a clean exit unless shutdown was asked for.
        let outcome = match outcome {
            Ok(())
                if kind == RoleKind::Coordinator
                    && !ctx.gate.is_signaled()
                    && !ctx.shutdown.is_cancelled() =>
            {
                Err(RoleError::ExitedBeforeReady)
            }
            other => other,
        };

        match &outcome {
            Ok(()) => info!(logger, "Role stopped"),
            Err(e) if kind == RoleKind::Coordinator => {
                error!(logger, "Coordinator failed, aborting bootstrap"; "error" => %e);
                ctx.shutdown.cancel();
            }
            Err(e) => warn!(logger, "Role exited with error"; "error" => %e),
        }

        RoleExit {
            name,
            kind,
            outcome,
        }
    }

    /// Returns `Ok(false)` when shutdown fired before the gate opened
    async fn await_gate(ctx: &RoleContext, limit: Option<Duration>) -> Result<bool, GateError> {
        let wait = async {
            match limit {
                Some(limit) => ctx.gate.wait_timeout(limit).await,
                None => {
                    ctx.gate.wait().await;
                    Ok(())
                }
            }
        };

        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => Ok(false),
            ready = wait => ready.map(|_| true),
        }
    }
}

pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
