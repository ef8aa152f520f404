//! taskpool: background task execution on a pool of worker processes.
//!
//! The host talks to one manager process through [`ManagerProxy`]. The manager
//! owns a pool of workers, holds tasks until their prerequisites have produced
//! values, and streams every finished task back up. Host code registers task
//! kinds in a [`TaskRegistry`] and calls [`run_if_child`] first thing in `main`
//! so the same binary can serve as manager and worker.

pub mod bridge;
pub mod client;
pub mod config;
pub mod logging;
pub mod manager;
pub mod method;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use bridge::correlation::ProtocolTimeout;
pub use bridge::protocol::{Status, Verb};
pub use client::{ManagerProxy, StagedTask, StartError, SubmitError, TaskCallback};
pub use config::ManagerConfig;
pub use logging::init_tracing;
pub use method::{TaskMethod, stage_tasks};
pub use process::{CommandSpawner, LocalSpawner, ProcessSpawner, run_if_child};
pub use registry::{TaskHandler, TaskInput, TaskRegistry};
pub use task::{FaultKind, FinishedTask, TaskFault, TaskId, TaskOutcome, TaskSpec};
