//! Dataflow scheduler.
//!
//! Holds tasks whose prerequisites have not all produced a value, and the
//! values that pending tasks still need. A task becomes a `WorkerTask` only
//! when every prerequisite has a recorded value; the values are passed as
//! positional arguments in the order the prerequisites were declared.
//!
//! Pure bookkeeping: no I/O, no clocks. The manager feeds it admissions and
//! completions and dispatches whatever comes back ready.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::task::{FinishedTask, Task, TaskFault, TaskId, TaskOutcome, WorkerTask};

struct PendingTask {
    task: Task,
    /// Prerequisites without a recorded value yet.
    outstanding: HashSet<TaskId>,
}

/// What a completion unlocked.
#[derive(Debug, Default, PartialEq)]
pub struct Completion {
    /// Tasks now ready to dispatch, in identity order.
    pub ready: Vec<WorkerTask>,
    /// Pending tasks that can never run because a prerequisite faulted.
    pub failed: Vec<FinishedTask>,
}

#[derive(Default)]
pub struct DataflowScheduler {
    pending: HashMap<TaskId, PendingTask>,
    results: HashMap<TaskId, Value>,
}

impl DataflowScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a submitted task. Returns it bound to its arguments when it can
    /// run right away, otherwise parks it.
    ///
    /// A prerequisite counts as satisfied only if its value is still cached,
    /// which holds for any prerequisite submitted in the same batch or still
    /// referenced by another pending task.
    pub fn admit(&mut self, task: Task) -> Option<WorkerTask> {
        let outstanding: HashSet<TaskId> = task
            .prerequisites
            .iter()
            .copied()
            .filter(|id| !self.results.contains_key(id))
            .collect();

        if outstanding.is_empty() {
            let worker_task = self.bind(task);
            self.prune();
            return Some(worker_task);
        }

        tracing::debug!(
            task_id = %task.id,
            waiting_on = outstanding.len(),
            "Task pending on prerequisites"
        );
        self.pending.insert(task.id, PendingTask { task, outstanding });
        None
    }

    /// Record a finished task and return what it unlocked.
    pub fn complete(&mut self, finished: &FinishedTask) -> Completion {
        let mut completion = Completion::default();

        match &finished.outcome {
            TaskOutcome::Value(value) => {
                if self.is_referenced(finished.id) {
                    self.results.insert(finished.id, value.clone());
                }
                for pending in self.pending.values_mut() {
                    pending.outstanding.remove(&finished.id);
                }

                let mut ready_ids: Vec<TaskId> = self
                    .pending
                    .iter()
                    .filter(|(_, pending)| pending.outstanding.is_empty())
                    .map(|(id, _)| *id)
                    .collect();
                ready_ids.sort_unstable();

                for id in ready_ids {
                    if let Some(pending) = self.pending.remove(&id) {
                        completion.ready.push(self.bind(pending.task));
                    }
                }
            }
            TaskOutcome::Fault(_) => {
                completion.failed = self.cascade_failure(finished.id);
            }
        }

        self.prune();
        completion
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn cached_len(&self) -> usize {
        self.results.len()
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        self.pending.contains_key(&id)
    }

    fn bind(&self, task: Task) -> WorkerTask {
        let arguments = task
            .prerequisites
            .iter()
            .map(|id| self.results.get(id).cloned().unwrap_or(Value::Null))
            .collect();
        WorkerTask::new(task, arguments)
    }

    fn is_referenced(&self, id: TaskId) -> bool {
        self.pending
            .values()
            .any(|pending| pending.task.prerequisites.contains(&id))
    }

    /// Drop cached values no pending task needs any more.
    fn prune(&mut self) {
        let pending = &self.pending;
        self.results.retain(|id, _| {
            pending
                .values()
                .any(|p| p.task.prerequisites.contains(id))
        });
    }

    /// Remove every pending task that depends, directly or not, on `failed`.
    fn cascade_failure(&mut self, failed: TaskId) -> Vec<FinishedTask> {
        let mut faults = Vec::new();
        let mut queue = VecDeque::from([failed]);

        while let Some(cause) = queue.pop_front() {
            let mut dependents: Vec<TaskId> = self
                .pending
                .iter()
                .filter(|(_, pending)| pending.task.prerequisites.contains(&cause))
                .map(|(id, _)| *id)
                .collect();
            dependents.sort_unstable();

            for id in dependents {
                if self.pending.remove(&id).is_some() {
                    tracing::debug!(task_id = %id, prerequisite = %cause, "Prerequisite failed");
                    faults.push(FinishedTask::fault(id, TaskFault::prerequisite_failed(cause)));
                    queue.push_back(id);
                }
            }
        }

        faults
    }
}
