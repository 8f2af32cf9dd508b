//! Task-queue engine owned by the coordinator role.
//!
//! This module provides:
//! - The execution state machine shared by workflows and activities
//! - An in-memory store with per-queue long polling and deadline enforcement
//! - The HTTP/JSON front-end workers and clients talk to

pub mod error;
pub mod messages;
pub mod server;
pub mod state;
pub mod store;

pub use error::{validate_task_queue, EngineError};
pub use messages::WorkflowIdConflictPolicy;
pub use server::EngineServer;
pub use state::{ExecutionKind, ExecutionState, Failure, FailureKind, TaskOutcome};
pub use store::{Engine, EngineOptions};
