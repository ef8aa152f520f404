//! Client facade - the only part of the pool the host application touches.
//!
//! `ManagerProxy` owns a private current-thread runtime and drives it only
//! inside its own calls, so host code stays synchronous. Results come back
//! through `poll_tasks`, which fires each task's callback exactly once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use crate::bridge::channel::FrameSender;
use crate::bridge::correlation::{self, ProtocolTimeout, Requester};
use crate::bridge::protocol::{ManagerInbound, Outbound, SessionId, Status, Verb};
use crate::config::ManagerConfig;
use crate::process::{
    HandshakeError, ProcessControl, ProcessRole, ProcessSpawner, SpawnError, SpawnedProcess,
    await_ready,
};
use crate::task::{FinishedTask, Task, TaskFault, TaskId, TaskIdAllocator, TaskOutcome, TaskSpec};

pub type ResultHandler = Box<dyn FnOnce(Value) + Send>;
pub type FaultHandler = Box<dyn FnOnce(TaskFault) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to build runtime: {0}")]
    Runtime(io::Error),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("manager setup failed: {0}")]
    Handshake(#[from] HandshakeError),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("task name '{0}' staged twice")]
    DuplicateName(String),
    #[error("task '{task}' depends on unknown task '{prerequisite}'")]
    UnknownPrerequisite { task: String, prerequisite: String },
    #[error("dependency cycle among {0:?}")]
    Cycle(Vec<String>),
    #[error("manager is not running")]
    Closed,
    #[error("failed to send tasks: {0}")]
    Disconnected(io::Error),
}

/// A unit of work plus what to do with its outcome. Never leaves the host.
pub struct TaskCallback {
    pub start: TaskSpec,
    on_result: ResultHandler,
    on_fault: Option<FaultHandler>,
}

impl TaskCallback {
    pub fn new(start: TaskSpec, on_result: impl FnOnce(Value) + Send + 'static) -> Self {
        Self {
            start,
            on_result: Box::new(on_result),
            on_fault: None,
        }
    }

    pub fn with_fault_handler(mut self, on_fault: impl FnOnce(TaskFault) + Send + 'static) -> Self {
        self.on_fault = Some(Box::new(on_fault));
        self
    }

    fn deliver(self, id: TaskId, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Value(value) => (self.on_result)(value),
            TaskOutcome::Fault(fault) => match self.on_fault {
                Some(on_fault) => on_fault(fault),
                None => {
                    tracing::warn!(task_id = %id, kind = %self.start.kind, %fault, "Unhandled task fault");
                }
            },
        }
    }
}

impl std::fmt::Debug for TaskCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCallback")
            .field("start", &self.start)
            .field("has_fault_handler", &self.on_fault.is_some())
            .finish()
    }
}

/// One entry of a `schedule_tasks` batch. Prerequisite results become the
/// task's positional arguments in the order listed here.
#[derive(Debug)]
pub struct StagedTask {
    pub callback: TaskCallback,
    pub prerequisites: Vec<String>,
}

impl StagedTask {
    pub fn new(callback: TaskCallback) -> Self {
        Self {
            callback,
            prerequisites: Vec::new(),
        }
    }

    pub fn after<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites = prerequisites.into_iter().map(Into::into).collect();
        self
    }
}

/// Order staged names so every prerequisite comes before its dependents.
/// Ties keep submission order.
fn topological_order(
    staged: &[(String, StagedTask)],
) -> Result<Vec<usize>, SubmitError> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(staged.len());
    for (i, (name, _)) in staged.iter().enumerate() {
        if index.insert(name.as_str(), i).is_some() {
            return Err(SubmitError::DuplicateName(name.clone()));
        }
    }

    let mut waiting_on = vec![0usize; staged.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); staged.len()];
    for (i, (name, task)) in staged.iter().enumerate() {
        let unique: HashSet<&str> = task.prerequisites.iter().map(String::as_str).collect();
        for prerequisite in unique {
            let Some(&p) = index.get(prerequisite) else {
                return Err(SubmitError::UnknownPrerequisite {
                    task: name.clone(),
                    prerequisite: prerequisite.to_string(),
                });
            };
            waiting_on[i] += 1;
            dependents[p].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..staged.len()).filter(|&i| waiting_on[i] == 0).collect();
    let mut order = Vec::with_capacity(staged.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        let mut unlocked: Vec<usize> = Vec::new();
        for &d in &dependents[i] {
            waiting_on[d] -= 1;
            if waiting_on[d] == 0 {
                unlocked.push(d);
            }
        }
        unlocked.sort_unstable();
        queue.extend(unlocked);
    }

    if order.len() < staged.len() {
        let mut cycle: Vec<String> = (0..staged.len())
            .filter(|&i| waiting_on[i] > 0)
            .map(|i| staged[i].0.clone())
            .collect();
        cycle.sort();
        return Err(SubmitError::Cycle(cycle));
    }
    Ok(order)
}

/// Host-side handle on a manager process.
///
/// Owns a private current-thread runtime and blocks on it, so it must be
/// driven from plain threads. Calling any method (or dropping it) from inside
/// a tokio runtime panics; async callers go through `spawn_blocking`.
pub struct ManagerProxy {
    config: ManagerConfig,
    session: SessionId,
    process: Option<ProcessControl>,
    sink: FrameSender<ManagerInbound>,
    requester: Arc<Requester<Verb, Status, ManagerInbound>>,
    finished: mpsc::UnboundedReceiver<FinishedTask>,
    callbacks: HashMap<TaskId, TaskCallback>,
    ids: TaskIdAllocator,
    runtime: Runtime,
}

impl ManagerProxy {
    /// Spawn a manager (which spawns its pool) and wait for it to be ready.
    pub fn start(config: ManagerConfig, spawner: Arc<dyn ProcessSpawner>) -> Result<Self, StartError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(StartError::Runtime)?;
        let session = SessionId::new();

        let (control, mut reader, sink) = runtime.block_on(async {
            let SpawnedProcess { link, mut control } =
                spawner.spawn(ProcessRole::Manager, &config.name).map_err(StartError::Spawn)?;
            let (mut reader, sink) = link.into_framed::<Outbound, ManagerInbound>();

            let handshake = async {
                sink.send(ManagerInbound::Init {
                    session,
                    config: config.clone(),
                })
                .await
                .map_err(HandshakeError::Send)?;
                await_ready(&mut reader, session, config.setup_timeout).await
            };
            if let Err(e) = handshake.await {
                control.kill();
                let _ = control.wait(config.kill_timeout).await;
                return Err(StartError::Handshake(e));
            }
            Ok::<_, StartError>((control, reader, sink))
        })?;

        let (requester, router) = Requester::new(sink.clone(), config.poll_interval);
        let (finished_tx, finished) = mpsc::unbounded_channel();
        runtime.spawn(async move {
            loop {
                match reader.next().await {
                    Some(Ok(Outbound::Finished { task })) => {
                        if finished_tx.send(task).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Outbound::Reply(reply))) => {
                        router.route(reply);
                    }
                    Some(Ok(Outbound::Ready { .. })) => {
                        tracing::warn!("Unexpected Ready after setup");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Manager link error");
                        break;
                    }
                    None => {
                        tracing::debug!("Manager link closed");
                        break;
                    }
                }
            }
        });

        tracing::info!(manager = %config.name, %session, "Manager started");
        Ok(Self {
            config,
            session,
            process: Some(control),
            sink,
            requester: Arc::new(requester),
            finished,
            callbacks: HashMap::new(),
            ids: TaskIdAllocator::new(),
            runtime,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Drive `future` to completion on the facade's runtime.
    pub fn synchronize<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Like `synchronize`, but give up after `timeout`.
    pub fn exit_after<F: Future>(
        &self,
        future: F,
        timeout: Duration,
    ) -> Result<F::Output, ProtocolTimeout> {
        self.runtime.block_on(correlation::exit_after(future, timeout))
    }

    fn send_batch(&mut self, tasks: Vec<Task>) -> Result<(), SubmitError> {
        if self.process.is_none() {
            return Err(SubmitError::Closed);
        }
        let sink = self.sink.clone();
        self.synchronize(sink.send(ManagerInbound::Submit { tasks }))
            .map_err(SubmitError::Disconnected)
    }

    pub fn schedule_task(&mut self, callback: TaskCallback) -> Result<TaskId, SubmitError> {
        let id = self.ids.next();
        let task = Task::new(id, callback.start.clone());
        tracing::debug!(task_id = %id, kind = %task.work.kind, "Scheduling task");
        self.send_batch(vec![task])?;
        self.callbacks.insert(id, callback);
        Ok(id)
    }

    /// Submit a named batch in one step. Names resolve to identities within
    /// the batch; the whole batch is rejected on a duplicate name, an unknown
    /// prerequisite, or a cycle.
    pub fn schedule_tasks<I, S>(&mut self, staged: I) -> Result<HashMap<String, TaskId>, SubmitError>
    where
        I: IntoIterator<Item = (S, StagedTask)>,
        S: Into<String>,
    {
        let staged: Vec<(String, StagedTask)> =
            staged.into_iter().map(|(name, task)| (name.into(), task)).collect();
        let order = topological_order(&staged)?;

        let mut ids: HashMap<String, TaskId> = HashMap::with_capacity(staged.len());
        for &i in &order {
            ids.insert(staged[i].0.clone(), self.ids.next());
        }

        let mut tasks = Vec::with_capacity(staged.len());
        for &i in &order {
            let (name, entry) = &staged[i];
            let prerequisites = entry
                .prerequisites
                .iter()
                .filter_map(|p| ids.get(p).copied())
                .collect();
            tasks.push(Task::new(ids[name], entry.callback.start.clone()).with_prerequisites(prerequisites));
        }

        tracing::debug!(count = tasks.len(), "Scheduling batch");
        self.send_batch(tasks)?;

        for (name, entry) in staged {
            self.callbacks.insert(ids[&name], entry.callback);
        }
        Ok(ids)
    }

    /// Let background work run for one poll interval, then fire the callbacks
    /// of every task that finished. Returns how many fired.
    pub fn poll_tasks(&mut self) -> usize {
        // The timer registers with the runtime on creation, so build it inside.
        let interval = self.config.poll_interval;
        self.runtime.block_on(async move { tokio::time::sleep(interval).await });

        let mut delivered = 0;
        while let Ok(finished) = self.finished.try_recv() {
            match self.callbacks.remove(&finished.id) {
                Some(callback) => {
                    callback.deliver(finished.id, finished.outcome);
                    delivered += 1;
                }
                None => {
                    tracing::debug!(task_id = %finished.id, "Finished task without callback");
                }
            }
        }
        delivered
    }

    /// Poll until every submitted task has delivered, or `timeout` passes.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.callbacks.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            self.poll_tasks();
        }
        true
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Send a control verb. `None` uses the configured request timeout.
    pub fn make_request(
        &self,
        verb: Verb,
        timeout: Option<Duration>,
    ) -> Result<Status, ProtocolTimeout> {
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        let requester = Arc::clone(&self.requester);
        self.synchronize(async move { requester.get_answer(verb, timeout).await })
    }

    /// Drain the pool and wake it again. True when both steps were acknowledged.
    pub fn join(&self, timeout: Duration) -> bool {
        match self.make_request(Verb::Join, Some(timeout)) {
            Ok(Status::Sleeping) => {}
            Ok(status) => {
                tracing::warn!(%status, "Unexpected status after JOIN");
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Manager did not acknowledge JOIN");
                return false;
            }
        }
        matches!(self.make_request(Verb::StopSleeping, None), Ok(Status::Running))
    }

    /// Ask the manager to stop, then SIGTERM and reap it.
    pub fn terminate(&mut self) {
        let timeout = self.config.terminate_timeout;
        self.shut_down(true, timeout);
    }

    /// Ask the manager to stop, then SIGKILL and reap it.
    pub fn kill(&mut self) {
        let timeout = self.config.kill_timeout;
        self.shut_down(false, timeout);
    }

    fn shut_down(&mut self, graceful: bool, timeout: Duration) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        if process.is_alive() {
            if let Err(e) = self.make_request(Verb::Stop, Some(timeout)) {
                tracing::debug!(error = %e, "No STOP acknowledgement");
            }
        }
        self.runtime.block_on(async {
            if !process.wait(timeout).await {
                process.shut_down(graceful, timeout).await;
            }
        });
        tracing::info!(manager = %self.config.name, graceful, "Manager shut down");
    }

    pub fn is_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(process) => process.is_alive(),
            None => false,
        }
    }
}

impl Drop for ManagerProxy {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.kill();
            let timeout = self.config.kill_timeout;
            self.runtime.block_on(async {
                let _ = process.wait(timeout).await;
            });
        }
    }
}
