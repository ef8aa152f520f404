//! Manager process - owns the worker pool and the dataflow scheduler.
//!
//! Flow:
//! 1. Read `Init` from the host (session + config)
//! 2. Spawn the pool, handshake each worker, then answer `Ready`
//! 3. Event loop: admit submissions, dispatch ready tasks, answer control verbs
//! 4. Per-worker reader tasks forward finished tasks upward and release dependents
//! 5. On `STOP`, host disconnect or inactivity: stop workers and exit
//!
//! ```text
//! STARTUP -> RUNNING <-> SLEEPING -> STOPPED -> ZOMBIE
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use futures::future::join_all;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::Instant;

use crate::bridge::channel::{ChannelPair, FrameReader, FrameSender};
use crate::bridge::correlation::{
    ProtocolTimeout, Replier, ReplyHandle, ReplyRouter, Requester,
};
use crate::bridge::protocol::{
    ManagerInbound, Outbound, Reply, Request, SessionId, Status, Verb, WorkerInbound,
};
use crate::config::ManagerConfig;
use crate::process::{
    HandshakeError, ProcessControl, ProcessRole, ProcessSpawner, SpawnError, SpawnedProcess,
    await_ready,
};
use crate::scheduler::DataflowScheduler;
use crate::task::{FinishedTask, Task, TaskFault, TaskId, WorkerTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerStartError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

/// Manager-side handle on one worker process.
pub struct WorkerProxy {
    id: WorkerId,
    name: String,
    sink: FrameSender<WorkerInbound>,
    requester: Requester<Verb, Status, WorkerInbound>,
    process: Mutex<ProcessControl>,
    in_flight: AtomicUsize,
    live: AtomicBool,
}

impl WorkerProxy {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks dispatched to this worker and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// False once the link closed or the worker was killed.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn mark_lost(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.in_flight.store(0, Ordering::SeqCst);
    }

    pub async fn make_request(
        &self,
        verb: Verb,
        timeout: Duration,
    ) -> Result<Status, ProtocolTimeout> {
        self.requester.get_answer(verb, timeout).await
    }

    pub async fn dispatch(&self, task: WorkerTask) -> io::Result<()> {
        tracing::debug!(worker = %self.name, task_id = %task.id(), "Dispatching task");
        self.sink.send(WorkerInbound::Execute { task }).await
    }

    /// Drain the worker, then wake it. False if either step fails.
    pub async fn join(&self, timeout: Duration, wake_timeout: Duration) -> bool {
        match self.make_request(Verb::Join, timeout).await {
            Ok(Status::Sleeping) => {}
            Ok(status) => {
                tracing::warn!(worker = %self.name, %status, "Unexpected status after JOIN");
                return false;
            }
            Err(e) => {
                tracing::warn!(worker = %self.name, error = %e, "Worker did not acknowledge JOIN");
                return false;
            }
        }
        match self.make_request(Verb::StopSleeping, wake_timeout).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(worker = %self.name, error = %e, "Worker did not wake after JOIN");
                false
            }
        }
    }

    /// Courtesy `STOP`, then SIGKILL and reap.
    pub async fn kill(&self, timeout: Duration) {
        self.stop_then(false, timeout).await;
    }

    /// Courtesy `STOP`, then SIGTERM and reap.
    pub async fn terminate(&self, timeout: Duration) {
        self.stop_then(true, timeout).await;
    }

    async fn stop_then(&self, graceful: bool, timeout: Duration) {
        if self.is_live() {
            if let Err(e) = self.make_request(Verb::Stop, timeout).await {
                tracing::debug!(worker = %self.name, error = %e, "No STOP acknowledgement");
            }
        }
        self.mark_lost();
        let mut process = self.process.lock().await;
        if process.is_alive() && process.wait(timeout).await {
            return;
        }
        process.shut_down(graceful, timeout).await;
    }

    pub async fn is_alive(&self) -> bool {
        self.is_live() && self.process.lock().await.is_alive()
    }
}

struct ManagerState {
    status: Status,
    scheduler: DataflowScheduler,
    /// Submitted while sleeping; admitted on wake.
    deferred: VecDeque<Task>,
    /// Ready but not dispatched (sleeping, or no live worker).
    held: VecDeque<WorkerTask>,
    assignments: HashMap<TaskId, WorkerId>,
    last_activity: Instant,
}

pub struct ManagerCore {
    config: ManagerConfig,
    spawner: Arc<dyn ProcessSpawner>,
    host: FrameSender<Outbound>,
    state: StdMutex<ManagerState>,
    pool: DashMap<WorkerId, Arc<WorkerProxy>>,
    next_worker: AtomicUsize,
    cursor: AtomicUsize,
    shutdown: Notify,
}

impl ManagerCore {
    pub fn new(
        config: ManagerConfig,
        spawner: Arc<dyn ProcessSpawner>,
        host: FrameSender<Outbound>,
    ) -> Self {
        Self {
            config,
            spawner,
            host,
            state: StdMutex::new(ManagerState {
                status: Status::Startup,
                scheduler: DataflowScheduler::new(),
                deferred: VecDeque::new(),
                held: VecDeque::new(),
                assignments: HashMap::new(),
                last_activity: Instant::now(),
            }),
            pool: DashMap::new(),
            next_worker: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            shutdown: Notify::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> Status {
        self.lock_state().status
    }

    fn set_status(&self, status: Status) {
        let mut state = self.lock_state();
        if state.status != status {
            tracing::debug!(manager = %self.config.name, from = %state.status, to = %status, "Status change");
            state.status = status;
        }
    }

    fn touch(&self) {
        self.lock_state().last_activity = Instant::now();
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    fn workers(&self) -> Vec<Arc<WorkerProxy>> {
        let mut workers: Vec<Arc<WorkerProxy>> =
            self.pool.iter().map(|entry| Arc::clone(entry.value())).collect();
        workers.sort_by_key(|w| w.id);
        workers
    }

    /// Spawn one worker, complete its handshake and start its reader task.
    pub async fn add_worker(self: &Arc<Self>) -> Result<Arc<WorkerProxy>, WorkerStartError> {
        let id = WorkerId(self.next_worker.fetch_add(1, Ordering::SeqCst));
        let name = format!("{}-{}", self.config.name, id);

        let SpawnedProcess { link, mut control } = self.spawner.spawn(ProcessRole::Worker, &name)?;
        let (mut reader, sink) = link.into_framed::<Outbound, WorkerInbound>();

        let session = SessionId::new();
        let handshake = async {
            sink.send(WorkerInbound::Init {
                session,
                name: name.clone(),
                poll_interval_ms: self.config.poll_interval.as_millis() as u64,
            })
            .await
            .map_err(HandshakeError::Send)?;
            await_ready(&mut reader, session, self.config.setup_timeout).await
        };
        if let Err(e) = handshake.await {
            tracing::error!(worker = %name, error = %e, "Worker setup failed");
            control.kill();
            let _ = control.wait(self.config.kill_timeout).await;
            return Err(e.into());
        }

        let (requester, router) = Requester::new(sink.clone(), self.config.poll_interval);
        let proxy = Arc::new(WorkerProxy {
            id,
            name,
            sink,
            requester,
            process: Mutex::new(control),
            in_flight: AtomicUsize::new(0),
            live: AtomicBool::new(true),
        });
        self.pool.insert(id, Arc::clone(&proxy));
        tracing::info!(worker = %proxy.name, "Worker ready");

        let core = Arc::clone(self);
        tokio::spawn(async move {
            worker_reader(core, id, reader, router).await;
        });

        Ok(proxy)
    }

    /// Admit a batch in one step. Deferred as a whole while not running.
    pub async fn submit(self: &Arc<Self>, tasks: Vec<Task>) {
        let ready = {
            let mut state = self.lock_state();
            state.last_activity = Instant::now();
            if state.status != Status::Running {
                tracing::debug!(count = tasks.len(), status = %state.status, "Deferring submission");
                state.deferred.extend(tasks);
                return;
            }
            let mut ready = Vec::new();
            for task in tasks {
                tracing::debug!(task_id = %task.id, kind = %task.work.kind, "Task submitted");
                if let Some(worker_task) = state.scheduler.admit(task) {
                    ready.push(worker_task);
                }
            }
            ready
        };
        self.dispatch(ready).await;
    }

    /// Least-loaded live worker, ties broken round robin.
    fn pick_worker(&self) -> Option<Arc<WorkerProxy>> {
        let mut live: Vec<Arc<WorkerProxy>> =
            self.workers().into_iter().filter(|w| w.is_live()).collect();
        if live.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % live.len();
        live.rotate_left(start);
        live.into_iter().min_by_key(|w| w.in_flight())
    }

    /// Send ready tasks to workers. Held instead while not running or with no live worker.
    pub async fn dispatch(self: &Arc<Self>, tasks: Vec<WorkerTask>) {
        if tasks.is_empty() {
            return;
        }

        let mut sends = Vec::with_capacity(tasks.len());
        {
            let mut state = self.lock_state();
            for task in tasks {
                if state.status != Status::Running {
                    state.held.push_back(task);
                    continue;
                }
                match self.pick_worker() {
                    Some(worker) => {
                        state.assignments.insert(task.id(), worker.id);
                        worker.in_flight.fetch_add(1, Ordering::SeqCst);
                        sends.push((worker, task));
                    }
                    None => {
                        tracing::warn!(task_id = %task.id(), "No live worker, holding task");
                        state.held.push_back(task);
                    }
                }
            }
        }

        for (worker, task) in sends {
            if let Err(e) = worker.dispatch(task).await {
                tracing::warn!(worker = %worker.name, error = %e, "Dispatch failed, worker lost");
                self.on_worker_lost(worker.id).await;
            }
        }
    }

    /// A worker reported a task: forward it upward, then release its dependents.
    pub async fn on_finished(self: &Arc<Self>, worker: WorkerId, finished: FinishedTask) {
        let completion = {
            let mut state = self.lock_state();
            state.last_activity = Instant::now();
            if state.assignments.get(&finished.id) != Some(&worker) {
                tracing::debug!(task_id = %finished.id, %worker, "Ignoring unassigned finished task");
                return;
            }
            state.assignments.remove(&finished.id);
            state.scheduler.complete(&finished)
        };
        if let Some(proxy) = self.pool.get(&worker).map(|entry| Arc::clone(entry.value())) {
            let _ = proxy
                .in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }

        tracing::debug!(task_id = %finished.id, %worker, fault = finished.is_fault(), "Task finished");
        self.forward(finished).await;
        for failed in completion.failed {
            self.forward(failed).await;
        }
        self.dispatch(completion.ready).await;
    }

    /// Fail every task still assigned to `worker`. Idempotent.
    async fn on_worker_lost(self: &Arc<Self>, worker: WorkerId) {
        let name = match self.pool.get(&worker) {
            Some(entry) => {
                entry.value().mark_lost();
                entry.value().name.clone()
            }
            None => format!("{}-{}", self.config.name, worker),
        };

        let faults = {
            let mut state = self.lock_state();
            let mut lost: Vec<TaskId> = state
                .assignments
                .iter()
                .filter(|(_, assigned)| **assigned == worker)
                .map(|(id, _)| *id)
                .collect();
            lost.sort_unstable();

            let mut faults = Vec::new();
            for id in lost {
                state.assignments.remove(&id);
                let finished = FinishedTask::fault(id, TaskFault::worker_lost(&name));
                let completion = state.scheduler.complete(&finished);
                faults.push(finished);
                faults.extend(completion.failed);
            }
            faults
        };

        if !faults.is_empty() {
            tracing::warn!(worker = %name, lost = faults.len(), "Worker lost with tasks in flight");
        }
        for finished in faults {
            self.forward(finished).await;
        }
    }

    async fn forward(&self, finished: FinishedTask) {
        if let Err(e) = self.host.send(Outbound::Finished { task: finished }).await {
            tracing::debug!(error = %e, "Host link closed, dropping finished task");
        }
    }

    /// Apply a control verb and return the resulting status.
    pub async fn handle_request(self: &Arc<Self>, verb: Verb) -> Status {
        self.touch();
        match verb {
            Verb::GetStatus => self.status(),
            Verb::StartSleeping => {
                let status = {
                    let mut state = self.lock_state();
                    if state.status == Status::Running {
                        state.status = Status::Sleeping;
                    }
                    state.status
                };
                if status == Status::Sleeping {
                    self.forward_to_workers(Verb::StartSleeping).await;
                }
                status
            }
            Verb::StopSleeping => self.wake().await,
            Verb::Stop => {
                self.stop_workers(false).await;
                self.set_status(Status::Stopped);
                Status::Stopped
            }
            Verb::Join => self.join().await,
            Verb::NotDefined => Status::NotDefined,
        }
    }

    /// Sleep, drain every worker, and replace any that fail to acknowledge.
    pub async fn join(self: &Arc<Self>) -> Status {
        {
            let mut state = self.lock_state();
            match state.status {
                Status::Running => state.status = Status::Sleeping,
                Status::Sleeping => {}
                other => return other,
            }
        }

        let join_timeout = self.config.worker_join_timeout;
        let wake_timeout = self.config.request_timeout;
        let results = join_all(self.workers().into_iter().map(|worker| async move {
            let joined = worker.is_live() && worker.join(join_timeout, wake_timeout).await;
            (worker, joined)
        }))
        .await;

        for (worker, joined) in results {
            if joined && worker.is_alive().await {
                continue;
            }
            tracing::warn!(worker = %worker.name, "Worker failed to join, replacing");
            worker.kill(self.config.kill_timeout).await;
            self.on_worker_lost(worker.id).await;
            self.pool.remove(&worker.id);
        }

        while self.pool.len() < self.config.pool_size {
            if let Err(e) = self.add_worker().await {
                tracing::error!(error = %e, "Failed to replace worker");
                break;
            }
        }

        tracing::debug!(manager = %self.config.name, workers = self.pool.len(), "Joined");
        self.status()
    }

    /// Wake up and release everything that queued up while sleeping.
    async fn wake(self: &Arc<Self>) -> Status {
        let ready = {
            let mut state = self.lock_state();
            if state.status != Status::Sleeping {
                return state.status;
            }
            state.status = Status::Running;
            let mut ready: Vec<WorkerTask> = state.held.drain(..).collect();
            let deferred: Vec<Task> = state.deferred.drain(..).collect();
            for task in deferred {
                if let Some(worker_task) = state.scheduler.admit(task) {
                    ready.push(worker_task);
                }
            }
            ready
        };
        // Workers must be running again before the released tasks reach them.
        self.forward_to_workers(Verb::StopSleeping).await;
        if !ready.is_empty() {
            tracing::debug!(count = ready.len(), "Releasing queued tasks");
        }
        self.dispatch(ready).await;
        Status::Running
    }

    /// Pass a sleeping verb on to every live worker and wait for the answers.
    async fn forward_to_workers(&self, verb: Verb) {
        let timeout = self.config.request_timeout;
        let workers: Vec<Arc<WorkerProxy>> =
            self.workers().into_iter().filter(|w| w.is_live()).collect();
        let answers = join_all(workers.iter().map(|worker| worker.make_request(verb, timeout))).await;
        for (worker, answer) in workers.iter().zip(answers) {
            match answer {
                Ok(status) => {
                    tracing::trace!(worker = %worker.name, %verb, %status, "Worker answered");
                }
                Err(e) => {
                    tracing::debug!(worker = %worker.name, %verb, error = %e, "Worker did not answer");
                }
            }
        }
    }

    /// Stop and reap every worker; empties the pool. `graceful` escalates
    /// through SIGTERM instead of going straight to SIGKILL.
    async fn stop_workers(self: &Arc<Self>, graceful: bool) {
        let workers = self.workers();
        if graceful {
            let timeout = self.config.terminate_timeout;
            join_all(workers.iter().map(|worker| worker.terminate(timeout))).await;
        } else {
            let timeout = self.config.kill_timeout;
            join_all(workers.iter().map(|worker| worker.kill(timeout))).await;
        }
        for worker in workers {
            self.on_worker_lost(worker.id).await;
            self.pool.remove(&worker.id);
        }
    }

    /// Inactivity deadline, if idle shutdown is configured.
    fn idle_deadline(&self) -> Option<Instant> {
        let after = self.config.idle_shutdown?;
        Some(self.lock_state().last_activity + after)
    }

    /// Idle long enough with nothing in flight. Tasks still in flight count
    /// as activity and restart the period.
    fn idle_expired(&self) -> bool {
        let Some(after) = self.config.idle_shutdown else {
            return false;
        };
        let mut state = self.lock_state();
        if !state.assignments.is_empty() {
            state.last_activity = Instant::now();
            return false;
        }
        state.last_activity.elapsed() >= after
    }
}

async fn worker_reader(
    core: Arc<ManagerCore>,
    id: WorkerId,
    mut reader: FrameReader<Outbound>,
    router: ReplyRouter<Status>,
) {
    loop {
        match reader.next().await {
            Some(Ok(Outbound::Finished { task })) => core.on_finished(id, task).await,
            Some(Ok(Outbound::Reply(reply))) => {
                router.route(reply);
            }
            Some(Ok(Outbound::Ready { .. })) => {
                tracing::warn!(worker = %id, "Unexpected Ready after setup");
            }
            Some(Err(e)) => {
                tracing::error!(worker = %id, error = %e, "Worker link error");
                break;
            }
            None => {
                tracing::debug!(worker = %id, "Worker link closed");
                break;
            }
        }
    }
    core.on_worker_lost(id).await;
}

async fn answer(
    core: Arc<ManagerCore>,
    request: Request<Verb>,
    replies: ReplyHandle<Status, Outbound>,
) {
    let status = core.handle_request(request.value).await;
    tracing::debug!(verb = %request.value, %status, "Answering request");
    if let Err(e) = replies.reply(Reply::to(&request, status)).await {
        tracing::warn!(error = %e, "Failed to send reply");
    }
    if request.value == Verb::Stop {
        core.shutdown.notify_one();
    }
}

/// Run a manager over `link` until `STOP`, host disconnect or idle timeout.
pub async fn run_manager_process(
    link: ChannelPair,
    spawner: Arc<dyn ProcessSpawner>,
) -> io::Result<()> {
    let (mut reader, host) = link.into_framed::<ManagerInbound, Outbound>();

    let (session, config) = match reader.next().await {
        Some(Ok(ManagerInbound::Init { session, config })) => (session, config),
        Some(Ok(other)) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected Init, got {other:?}"),
            ));
        }
        Some(Err(e)) => return Err(e),
        None => {
            tracing::info!("Host closed the link before Init");
            return Ok(());
        }
    };

    let pool_size = config.pool_size;
    tracing::info!(manager = %config.name, pool_size, "Starting worker pool");
    let core = Arc::new(ManagerCore::new(config, spawner, host.clone()));

    let started = join_all((0..pool_size).map(|_| core.add_worker())).await;
    if let Some(Err(e)) = started.into_iter().find(|r| r.is_err()) {
        core.stop_workers(false).await;
        return Err(io::Error::other(e));
    }

    host.send(Outbound::Ready { session }).await?;
    core.set_status(Status::Running);
    core.touch();
    tracing::info!(manager = %core.config.name, "Manager ready");

    let (mut replier, request_tx) = Replier::<Verb, Status, Outbound>::new(host.clone());
    let (submit_tx, mut submit_rx) = mpsc::unbounded_channel::<Vec<Task>>();

    let host_reader = tokio::spawn(async move {
        loop {
            match reader.next().await {
                Some(Ok(ManagerInbound::Submit { tasks })) => {
                    if submit_tx.send(tasks).is_err() {
                        break;
                    }
                }
                Some(Ok(ManagerInbound::Control(request))) => {
                    if request_tx.send(request).is_err() {
                        break;
                    }
                }
                Some(Ok(ManagerInbound::Init { .. })) => {
                    tracing::warn!("Received Init after startup");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Host link error");
                    break;
                }
                None => {
                    tracing::debug!("Host link closed");
                    break;
                }
            }
        }
    });

    loop {
        let idle_deadline = core.idle_deadline();
        tokio::select! {
            biased;

            _ = core.shutdown.notified() => {
                tracing::info!(manager = %core.config.name, "Stop requested");
                break;
            }

            // Before requests: a JOIN must see every batch sent ahead of it.
            tasks = submit_rx.recv() => {
                match tasks {
                    Some(tasks) => core.submit(tasks).await,
                    None => {
                        tracing::info!(manager = %core.config.name, "Host went away, exiting");
                        break;
                    }
                }
            }

            request = replier.next_request() => {
                match request {
                    Some(request) => {
                        tokio::spawn(answer(Arc::clone(&core), request, replier.reply_handle()));
                    }
                    None => {
                        tracing::info!(manager = %core.config.name, "Host went away, exiting");
                        break;
                    }
                }
            }

            _ = async {
                match idle_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                if core.idle_expired() {
                    tracing::info!(manager = %core.config.name, "Idle, shutting down");
                    break;
                }
            }
        }
    }

    core.stop_workers(true).await;
    core.set_status(Status::Stopped);

    let answered = replier.answer_pending(Status::Stopped).await;
    if answered > 0 {
        tracing::debug!(manager = %core.config.name, answered, "Answered requests queued at exit");
    }
    host_reader.abort();
    core.set_status(Status::Zombie);
    if let Err(e) = host.close().await {
        tracing::debug!(manager = %core.config.name, error = %e, "Host link already closed");
    }

    tracing::info!(manager = %core.config.name, "Manager exiting");
    Ok(())
}
