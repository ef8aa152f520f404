//! Task envelope: the value types that describe a unit of work, the concrete
//! dispatch a worker receives, and the terminal record it produces.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Identity of a task, unique within one manager lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Hands out strictly increasing task identities.
///
/// One allocator lives in each host-side manager handle, so identities restart
/// with every manager lifetime.
#[derive(Debug)]
pub struct TaskIdAllocator {
    last: AtomicU64,
}

impl Default for TaskIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskIdAllocator {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> TaskId {
        TaskId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Which registered handler to run, and the arguments bound at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl TaskSpec {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

impl std::fmt::Display for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind, self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub work: TaskSpec,
    /// Results of these tasks become the positional arguments, in this order.
    pub prerequisites: Vec<TaskId>,
}

impl Task {
    pub fn new(id: TaskId, work: TaskSpec) -> Self {
        Self {
            id,
            work,
            prerequisites: Vec::new(),
        }
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<TaskId>) -> Self {
        self.prerequisites = prerequisites;
        self
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}, {}>", self.work.kind, self.id)
    }
}

/// A task bound to its concrete arguments; only built at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub task: Task,
    pub arguments: Vec<serde_json::Value>,
}

impl WorkerTask {
    pub fn new(task: Task, arguments: Vec<serde_json::Value>) -> Self {
        Self { task, arguments }
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The task body returned an error.
    Raised,
    /// The task body panicked.
    Panicked,
    /// No handler is registered for the task kind.
    UnknownKind,
    /// Payload or arguments did not have the shape the handler expects.
    InvalidInput,
    /// A prerequisite finished with a fault, so this task never ran.
    PrerequisiteFailed,
    /// The worker holding the task died or was killed before reporting.
    WorkerLost,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FaultKind::Raised => "raised",
            FaultKind::Panicked => "panicked",
            FaultKind::UnknownKind => "unknown task kind",
            FaultKind::InvalidInput => "invalid input",
            FaultKind::PrerequisiteFailed => "prerequisite failed",
            FaultKind::WorkerLost => "worker lost",
        };
        f.write_str(name)
    }
}

/// A fault captured while producing a task's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskFault {
    pub kind: FaultKind,
    pub message: String,
}

impl TaskFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn raised(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Raised, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FaultKind::InvalidInput, message)
    }

    pub fn unknown_kind(kind: &str) -> Self {
        Self::new(FaultKind::UnknownKind, format!("no handler registered for '{kind}'"))
    }

    pub fn prerequisite_failed(prerequisite: TaskId) -> Self {
        Self::new(
            FaultKind::PrerequisiteFailed,
            format!("prerequisite {prerequisite} did not produce a value"),
        )
    }

    pub fn worker_lost(worker: &str) -> Self {
        Self::new(
            FaultKind::WorkerLost,
            format!("{worker} exited before reporting"),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Value(serde_json::Value),
    Fault(TaskFault),
}

/// Terminal record of a task. Produced exactly once per identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedTask {
    pub id: TaskId,
    pub outcome: TaskOutcome,
}

impl FinishedTask {
    pub fn value(id: TaskId, value: serde_json::Value) -> Self {
        Self {
            id,
            outcome: TaskOutcome::Value(value),
        }
    }

    pub fn fault(id: TaskId, fault: TaskFault) -> Self {
        Self {
            id,
            outcome: TaskOutcome::Fault(fault),
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Fault(_))
    }
}

impl std::fmt::Display for FinishedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            TaskOutcome::Value(value) => write!(f, "<{}, success:{}>", self.id, value),
            TaskOutcome::Fault(fault) => write!(f, "<{}, failure:{}>", self.id, fault),
        }
    }
}
