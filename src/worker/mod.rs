//! Worker side: function registry, execution contexts and the poll loop

pub mod context;
pub mod error;
pub mod poller;
pub mod registry;

pub use context::{ActivityContext, ActivityOptions, WorkflowContext};
pub use error::WorkflowError;
pub use poller::{Worker, WorkerOptions};
pub use registry::{BoxedFunction, Registry};
