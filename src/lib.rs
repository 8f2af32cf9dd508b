pub mod bootstrap;
pub mod client;
pub mod config;
pub mod engine;
pub mod instance;
pub mod logging;
pub mod roles;
pub mod worker;
pub mod workflows;

pub use bootstrap::{
    Bootstrap, BootstrapError, BootstrapHandle, GateError, ReadinessGate, Role, RoleContext,
    RoleError, RoleExit, RoleKind, ShutdownReport,
};
pub use client::{
    ClientError, Connection, ConnectionError, DialOptions, RunHandle, SharedConnection,
    SubmissionError, WorkflowClient, WorkflowInvocation, WorkflowResult,
};
pub use config::{ConfigError, NodeConfig, DEFAULT_TASK_QUEUE};
pub use engine::{EngineOptions, WorkflowIdConflictPolicy};
pub use instance::{Instance, InstanceError, InstanceSource, InstanceState};
pub use roles::{ClientRole, ClientTask, CoordinatorRole, WorkerRole};
pub use worker::{
    ActivityContext, ActivityOptions, Registry, WorkerOptions, WorkflowContext, WorkflowError,
};
