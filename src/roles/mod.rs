//! The concrete coordinator, worker and client roles

pub mod client;
pub mod coordinator;
pub mod worker;

pub use client::{ClientRole, ClientTask};
pub use coordinator::CoordinatorRole;
pub use worker::WorkerRole;
