//! Worker process supervision.

pub mod supervisor;
pub mod types;

pub use supervisor::{InstanceRequest, WorkerSupervisor};
pub use types::{SupervisorError, WorkerConfig, WorkerEvent, WorkerState};
