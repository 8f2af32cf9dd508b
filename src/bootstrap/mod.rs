//! Role bootstrap: readiness gate, join barrier, role lifecycle and the
//! orchestrator that ties them together.

pub mod barrier;
pub mod gate;
pub mod orchestrator;
pub mod role;

pub use barrier::{BarrierGuard, JoinBarrier};
pub use gate::{GateError, ReadinessGate};
pub use orchestrator::{Bootstrap, BootstrapError, BootstrapHandle, ShutdownReport};
pub use role::{Role, RoleContext, RoleError, RoleExit, RoleKind, RoleRunner};
