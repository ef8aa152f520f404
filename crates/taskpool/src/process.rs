//! Process roles, spawning and control.
//!
//! The same executable plays host, manager and worker. A spawned child learns
//! its role from `TASKPOOL_ROLE` and talks to its parent over its own stdio.
//! `ProcessSpawner` is the seam: `CommandSpawner` starts real OS processes,
//! `LocalSpawner` runs the same loops as tokio tasks over in-memory links.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::bridge::channel::{ChannelPair, FrameReader};
use crate::bridge::protocol::{Outbound, SessionId};
use crate::registry::TaskRegistry;

pub const ROLE_ENV: &str = "TASKPOOL_ROLE";
pub const NAME_ENV: &str = "TASKPOOL_PROCESS_NAME";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Manager,
    Worker,
}

impl ProcessRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessRole::Manager => "manager",
            ProcessRole::Worker => "worker",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "manager" => Some(ProcessRole::Manager),
            "worker" => Some(ProcessRole::Worker),
            _ => None,
        }
    }

    /// Role of the current process, if it was spawned as a child.
    pub fn from_env() -> Option<Self> {
        let raw = std::env::var(ROLE_ENV).ok()?;
        let role = Self::parse(&raw);
        if role.is_none() {
            tracing::warn!(value = %raw, "Ignoring unknown {ROLE_ENV}");
        }
        role
    }
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn requires a tokio runtime")]
    NoRuntime,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("failed to send init: {0}")]
    Send(io::Error),
    #[error("link error during setup: {0}")]
    Link(io::Error),
    #[error("process exited during setup")]
    Closed,
    #[error("no ready within {0:?}")]
    Timeout(Duration),
    #[error("ready for session {got}, expected {expected}")]
    SessionMismatch { expected: SessionId, got: SessionId },
}

/// Wait for `Ready` echoing `session`. Anything else before it is logged and skipped.
pub(crate) async fn await_ready(
    reader: &mut FrameReader<Outbound>,
    session: SessionId,
    timeout: Duration,
) -> Result<(), HandshakeError> {
    let ready = tokio::time::timeout(timeout, async {
        loop {
            match reader.next().await {
                Some(Ok(Outbound::Ready { session: got })) if got == session => return Ok(()),
                Some(Ok(Outbound::Ready { session: got })) => {
                    return Err(HandshakeError::SessionMismatch {
                        expected: session,
                        got,
                    });
                }
                Some(Ok(other)) => {
                    tracing::warn!(?other, "Unexpected message during setup");
                }
                Some(Err(e)) => return Err(HandshakeError::Link(e)),
                None => return Err(HandshakeError::Closed),
            }
        }
    })
    .await;

    match ready {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout(timeout)),
    }
}

/// Handle on a spawned manager or worker.
#[derive(Debug)]
pub enum ProcessControl {
    Child(Child),
    Local(JoinHandle<()>),
}

impl ProcessControl {
    pub fn id(&self) -> Option<u32> {
        match self {
            ProcessControl::Child(child) => child.id(),
            ProcessControl::Local(_) => None,
        }
    }

    pub fn is_alive(&mut self) -> bool {
        match self {
            ProcessControl::Child(child) => matches!(child.try_wait(), Ok(None)),
            ProcessControl::Local(handle) => !handle.is_finished(),
        }
    }

    /// SIGKILL, or abort for a local task.
    pub fn kill(&mut self) {
        match self {
            ProcessControl::Child(child) => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(error = %e, "Kill failed (already exited?)");
                }
            }
            ProcessControl::Local(handle) => handle.abort(),
        }
    }

    /// SIGTERM where available, otherwise the same as `kill`.
    pub fn terminate(&mut self) {
        match self {
            ProcessControl::Child(child) => {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    let Some(pid) = child.id() else {
                        return;
                    };
                    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        tracing::debug!(pid, error = %e, "SIGTERM failed");
                    }
                }

                #[cfg(not(unix))]
                {
                    let _ = child.start_kill();
                }
            }
            ProcessControl::Local(handle) => handle.abort(),
        }
    }

    /// Wait up to `timeout` for exit. Returns whether it exited.
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        match self {
            ProcessControl::Child(child) => {
                matches!(tokio::time::timeout(timeout, child.wait()).await, Ok(Ok(_)))
            }
            ProcessControl::Local(handle) => {
                handle.is_finished() || tokio::time::timeout(timeout, handle).await.is_ok()
            }
        }
    }

    /// Polite stop failed or was skipped: signal, then reap. Escalates to
    /// SIGKILL when a terminated process does not exit within `grace`.
    pub async fn shut_down(&mut self, graceful: bool, grace: Duration) {
        if !self.is_alive() {
            let _ = self.wait(grace).await;
            return;
        }
        if graceful {
            self.terminate();
            if self.wait(grace).await {
                return;
            }
            tracing::warn!(pid = ?self.id(), "Process ignored SIGTERM, killing");
        }
        self.kill();
        let _ = self.wait(grace).await;
    }
}

pub struct SpawnedProcess {
    pub link: ChannelPair,
    pub control: ProcessControl,
}

/// Extension point for how managers and workers are started.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, role: ProcessRole, name: &str) -> Result<SpawnedProcess, SpawnError>;
}

/// Starts children by re-executing a program with the role in its environment.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-execute the running binary.
    pub fn current_process() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, role: ProcessRole, name: &str) -> Result<SpawnedProcess, SpawnError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(SpawnError::NoRuntime);
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(ROLE_ENV, role.as_str())
            .env(NAME_ENV, name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        tracing::debug!(%role, name, pid = ?child.id(), "Spawned process");
        let link = ChannelPair::from_child(&mut child)?;
        Ok(SpawnedProcess {
            link,
            control: ProcessControl::Child(child),
        })
    }
}

/// Runs managers and workers as tasks on the current runtime.
#[derive(Debug, Clone)]
pub struct LocalSpawner {
    registry: Arc<TaskRegistry>,
}

impl LocalSpawner {
    pub fn new(registry: TaskRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

impl ProcessSpawner for LocalSpawner {
    fn spawn(&self, role: ProcessRole, name: &str) -> Result<SpawnedProcess, SpawnError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SpawnError::NoRuntime)?;
        let (parent_end, child_end) = ChannelPair::in_memory();
        let name = name.to_string();

        let handle = match role {
            ProcessRole::Worker => {
                let registry = Arc::clone(&self.registry);
                runtime.spawn(async move {
                    if let Err(e) = crate::worker::run_worker(registry, child_end).await {
                        tracing::warn!(worker = %name, error = %e, "Local worker exited with error");
                    }
                })
            }
            ProcessRole::Manager => {
                let spawner: Arc<dyn ProcessSpawner> = Arc::new(self.clone());
                runtime.spawn(async move {
                    if let Err(e) = crate::manager::run_manager_process(child_end, spawner).await {
                        tracing::warn!(manager = %name, error = %e, "Local manager exited with error");
                    }
                })
            }
        };

        Ok(SpawnedProcess {
            link: parent_end,
            control: ProcessControl::Local(handle),
        })
    }
}

/// Child entry point. Call first thing in `main`: when the process was spawned
/// as a manager or worker this runs that role to completion and returns its
/// result; otherwise returns `None` and the caller carries on as the host.
pub fn run_if_child(registry: TaskRegistry) -> Option<io::Result<()>> {
    let role = ProcessRole::from_env()?;
    crate::logging::init_tracing();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return Some(Err(e)),
    };

    let link = ChannelPair::stdio();
    let result = runtime.block_on(async move {
        match role {
            ProcessRole::Worker => crate::worker::run_worker(Arc::new(registry), link).await,
            ProcessRole::Manager => {
                let spawner: Arc<dyn ProcessSpawner> = Arc::new(CommandSpawner::current_process()?);
                crate::manager::run_manager_process(link, spawner).await
            }
        }
    });

    // The stdin reader may still be parked on a blocking read.
    runtime.shutdown_background();
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::FrameSender;
    use futures::StreamExt as _;

    #[test]
    fn role_names_round_trip() {
        for role in [ProcessRole::Manager, ProcessRole::Worker] {
            assert_eq!(ProcessRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(ProcessRole::parse("host"), None);
    }

    #[test]
    fn local_spawner_needs_a_runtime() {
        let spawner = LocalSpawner::new(TaskRegistry::new());
        assert!(matches!(
            spawner.spawn(ProcessRole::Worker, "worker-0"),
            Err(SpawnError::NoRuntime)
        ));
    }

    fn ready_pair() -> (FrameReader<Outbound>, FrameSender<Outbound>) {
        let (parent, child) = ChannelPair::in_memory();
        let (parent_rx, _parent_tx) =
            parent.into_framed::<Outbound, crate::bridge::protocol::WorkerInbound>();
        let (_child_rx, child_tx) =
            child.into_framed::<crate::bridge::protocol::WorkerInbound, Outbound>();
        (parent_rx, child_tx)
    }

    #[tokio::test]
    async fn ready_with_matching_session_completes_handshake() {
        let (mut reader, writer) = ready_pair();
        let session = SessionId::new();
        writer.send(Outbound::Ready { session }).await.unwrap();

        await_ready(&mut reader, session, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ready_for_another_session_is_rejected() {
        let (mut reader, writer) = ready_pair();
        writer
            .send(Outbound::Ready {
                session: SessionId::new(),
            })
            .await
            .unwrap();

        let err = await_ready(&mut reader, SessionId::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::SessionMismatch { .. }));
    }

    #[tokio::test]
    async fn silent_child_times_out() {
        let (mut reader, _writer) = ready_pair();
        let err = await_ready(&mut reader, SessionId::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(_)));
    }

    #[tokio::test]
    async fn closed_child_fails_setup() {
        let (mut reader, writer) = ready_pair();
        writer.close().await.unwrap();
        drop(writer);

        let err = await_ready(&mut reader, SessionId::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Closed));
        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn aborted_local_process_is_not_alive() {
        let mut control = ProcessControl::Local(tokio::spawn(std::future::pending::<()>()));
        assert!(control.is_alive());

        control.kill();
        assert!(control.wait(Duration::from_secs(1)).await);
        assert!(!control.is_alive());
    }
}
