//! Worker process - runs dispatched tasks and reports their outcome.
//!
//! The parent side (spawning, dispatch, draining) is in manager.rs.
//!
//! Link layout (child stdin/stdout, or an in-memory pair):
//! - Inbound: `Init` once, then `Execute` and `Control` frames
//! - Outbound: `Ready` once, then `Finished` and `Reply` frames
//!
//! Every task runs in its own tokio task so a slow or panicking body never
//! blocks control requests. A fault inside a body becomes a `FinishedTask`
//! carrying the fault; it never ends the worker.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Notify, mpsc};

use crate::bridge::channel::{ChannelPair, FrameSender};
use crate::bridge::correlation::{Replier, ReplyHandle};
use crate::bridge::protocol::{Outbound, Reply, Request, Status, Verb, WorkerInbound};
use crate::registry::{TaskInput, TaskRegistry, panic_message};
use crate::task::{FaultKind, FinishedTask, TaskFault, TaskOutcome, WorkerTask};

/// State shared by the worker loop, its request handlers and its running tasks.
pub struct WorkerCore {
    name: String,
    status: StdMutex<Status>,
    in_flight: AtomicUsize,
    /// Tasks received while not running; started on `STOP_SLEEPING`.
    backlog: StdMutex<VecDeque<WorkerTask>>,
    registry: Arc<TaskRegistry>,
    sink: FrameSender<Outbound>,
    poll_interval: Duration,
    shutdown: Notify,
}

impl WorkerCore {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<TaskRegistry>,
        sink: FrameSender<Outbound>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            status: StdMutex::new(Status::Startup),
            in_flight: AtomicUsize::new(0),
            backlog: StdMutex::new(VecDeque::new()),
            registry,
            sink,
            poll_interval,
            shutdown: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: Status) {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != status {
            tracing::debug!(worker = %self.name, from = %*current, to = %status, "Status change");
            *current = status;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Take a dispatched task: start it when running, otherwise hold it.
    pub fn accept(self: &Arc<Self>, task: WorkerTask) {
        if self.status() == Status::Running {
            self.start(task);
        } else {
            tracing::debug!(worker = %self.name, task_id = %task.id(), "Holding task while not running");
            self.backlog
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(task);
        }
    }

    fn start(self: &Arc<Self>, task: WorkerTask) {
        // Counted before the spawn so a JOIN arriving right after sees it.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let finished = core.execute(task).await;
            core.report(finished).await;
            core.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Send a finished task upstream. A result that cannot be framed is
    /// replaced by a fault so the manager still hears about the task.
    async fn report(&self, finished: FinishedTask) {
        let id = finished.id;
        let err = match self.sink.send(Outbound::Finished { task: finished }).await {
            Ok(()) => return,
            Err(e) => e,
        };
        if !matches!(err.kind(), io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData) {
            tracing::warn!(worker = %self.name, task_id = %id, error = %err, "Failed to report finished task");
            return;
        }

        tracing::warn!(worker = %self.name, task_id = %id, error = %err, "Result cannot be sent, reporting a fault instead");
        let fault = FinishedTask::fault(id, TaskFault::raised(format!("result cannot be reported: {err}")));
        if let Err(e) = self.sink.send(Outbound::Finished { task: fault }).await {
            tracing::warn!(worker = %self.name, task_id = %id, error = %e, "Failed to report finished task");
        }
    }

    /// Run one task to completion, capturing any fault.
    pub async fn execute(&self, task: WorkerTask) -> FinishedTask {
        let id = task.id();
        let kind = task.task.work.kind.clone();

        let Some(handler) = self.registry.get(&kind) else {
            tracing::warn!(worker = %self.name, task_id = %id, %kind, "Unknown task kind");
            return FinishedTask::fault(id, TaskFault::unknown_kind(&kind));
        };

        tracing::debug!(worker = %self.name, task_id = %id, %kind, "Running task");
        let input = TaskInput::new(task.task.work.payload, task.arguments);

        // Own task so a panic in an async body is contained.
        let joined = tokio::spawn(async move { handler.run(input).await }).await;
        let finished = match joined {
            Ok(Ok(value)) => FinishedTask::value(id, value),
            Ok(Err(fault)) => FinishedTask::fault(id, fault),
            Err(e) if e.is_panic() => FinishedTask::fault(
                id,
                TaskFault::new(FaultKind::Panicked, panic_message(e.into_panic())),
            ),
            Err(e) => FinishedTask::fault(id, TaskFault::raised(e.to_string())),
        };

        match &finished.outcome {
            TaskOutcome::Value(_) => {
                tracing::debug!(worker = %self.name, task_id = %id, "Task succeeded");
            }
            TaskOutcome::Fault(fault) => {
                tracing::info!(worker = %self.name, task_id = %id, %fault, "Task failed");
            }
        }
        finished
    }

    /// Apply a control verb and return the resulting status.
    pub async fn handle_request(self: &Arc<Self>, verb: Verb) -> Status {
        match verb {
            Verb::GetStatus => self.status(),
            Verb::StartSleeping => {
                if self.status() == Status::Running {
                    self.set_status(Status::Sleeping);
                }
                self.status()
            }
            Verb::StopSleeping => {
                if self.status() == Status::Sleeping {
                    self.set_status(Status::Running);
                    self.flush_backlog();
                }
                self.status()
            }
            Verb::Stop => {
                self.set_status(Status::Stopped);
                Status::Stopped
            }
            Verb::Join => {
                if self.status() == Status::Running {
                    self.set_status(Status::Sleeping);
                }
                while self.in_flight() > 0 {
                    tokio::time::sleep(self.poll_interval).await;
                }
                tracing::debug!(worker = %self.name, "Drained");
                self.status()
            }
            Verb::NotDefined => Status::NotDefined,
        }
    }

    fn flush_backlog(self: &Arc<Self>) {
        let held: Vec<WorkerTask> = self
            .backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if !held.is_empty() {
            tracing::debug!(worker = %self.name, count = held.len(), "Starting held tasks");
        }
        for task in held {
            self.start(task);
        }
    }
}

async fn answer(
    core: Arc<WorkerCore>,
    request: Request<Verb>,
    replies: ReplyHandle<Status, Outbound>,
) {
    let status = core.handle_request(request.value).await;
    tracing::trace!(worker = %core.name, verb = %request.value, %status, "Answering request");
    if let Err(e) = replies.reply(Reply::to(&request, status)).await {
        tracing::warn!(worker = %core.name, error = %e, "Failed to send reply");
    }
    // Stop only after the acknowledgement is on the wire.
    if request.value == Verb::Stop {
        core.shutdown.notify_one();
    }
}

/// Run the worker event loop until `STOP` or until the manager goes away.
pub async fn run_worker(registry: Arc<TaskRegistry>, link: ChannelPair) -> io::Result<()> {
    let (mut reader, sink) = link.into_framed::<WorkerInbound, Outbound>();

    let (session, name, poll_interval) = match reader.next().await {
        Some(Ok(WorkerInbound::Init {
            session,
            name,
            poll_interval_ms,
        })) => (session, name, Duration::from_millis(poll_interval_ms)),
        Some(Ok(other)) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected Init, got {other:?}"),
            ));
        }
        Some(Err(e)) => return Err(e),
        None => {
            tracing::info!("Manager closed the link before Init");
            return Ok(());
        }
    };

    let core = Arc::new(WorkerCore::new(
        name,
        registry,
        sink.clone(),
        poll_interval,
    ));
    sink.send(Outbound::Ready { session }).await?;
    core.set_status(Status::Running);
    tracing::info!(worker = %core.name, "Worker ready");

    let (mut replier, request_tx) = Replier::<Verb, Status, Outbound>::new(sink);
    let (execute_tx, mut execute_rx) = mpsc::unbounded_channel::<WorkerTask>();

    let worker_name = core.name.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match reader.next().await {
                Some(Ok(WorkerInbound::Execute { task })) => {
                    if execute_tx.send(task).is_err() {
                        break;
                    }
                }
                Some(Ok(WorkerInbound::Control(request))) => {
                    if request_tx.send(request).is_err() {
                        break;
                    }
                }
                Some(Ok(WorkerInbound::Init { .. })) => {
                    tracing::warn!(worker = %worker_name, "Received Init after startup");
                }
                Some(Err(e)) => {
                    tracing::error!(worker = %worker_name, error = %e, "Link error");
                    break;
                }
                None => {
                    tracing::debug!(worker = %worker_name, "Manager link closed");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            biased;

            _ = core.shutdown.notified() => {
                tracing::info!(worker = %core.name, "Stop requested");
                break;
            }

            // Before requests: a JOIN must see every task sent ahead of it.
            task = execute_rx.recv() => {
                match task {
                    Some(task) => core.accept(task),
                    None => {
                        tracing::info!(worker = %core.name, "Manager went away, exiting");
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
                        tracing::info!(worker = %core.name, "Manager went away, exiting");
                        break;
                    }
                }
            }
        }
    }

    core.set_status(Status::Stopped);
    let answered = replier.answer_pending(Status::Stopped).await;
    if answered > 0 {
        tracing::debug!(worker = %core.name, answered, "Answered requests queued at exit");
    }
    reader_task.abort();
    core.set_status(Status::Zombie);

    tracing::info!(worker = %core.name, "Worker exiting");
    Ok(())
}
