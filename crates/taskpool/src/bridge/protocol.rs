//! Wire protocol types for host, manager and worker processes.
//!
//! Every process link carries two kinds of traffic over one duplex channel:
//! - **Work**: task submissions going down, finished tasks coming back up
//! - **Control**: correlated `Request<Verb>` / `Reply<Status>` pairs
//!
//! Frames are internally tagged JSON objects (`"type": "..."`).

use serde::{Deserialize, Serialize};

use crate::config::ManagerConfig;
use crate::task::{FinishedTask, Task, WorkerTask};

/// Identifies one parent/child pairing so a child cannot be mistaken for
/// another parent's process during the startup handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tags a control request so its reply can be matched to the waiting caller.
///
/// Ids wrap around at `u32::MAX`; see `CorrelationTable` for the reuse rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u32);

impl CorrelationId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn successor(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request<T> {
    pub value: T,
    pub correlation_id: CorrelationId,
}

impl<T> Request<T> {
    pub fn new(value: T, correlation_id: CorrelationId) -> Self {
        Self {
            value,
            correlation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply<T> {
    pub value: T,
    pub correlation_id: CorrelationId,
}

impl<T> Reply<T> {
    pub fn new(value: T, correlation_id: CorrelationId) -> Self {
        Self {
            value,
            correlation_id,
        }
    }

    /// Reply to `request` with `value`, reusing its correlation id.
    pub fn to<Q>(request: &Request<Q>, value: T) -> Self {
        Self::new(value, request.correlation_id)
    }
}

/// Control verbs understood by managers and workers.
///
/// Anything else on the wire decodes as `NotDefined` and is answered with
/// `Status::NotDefined` without changing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    GetStatus,
    StartSleeping,
    StopSleeping,
    Stop,
    Join,
    #[serde(other)]
    NotDefined,
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Verb::GetStatus => "GET_STATUS",
            Verb::StartSleeping => "START_SLEEPING",
            Verb::StopSleeping => "STOP_SLEEPING",
            Verb::Stop => "STOP",
            Verb::Join => "JOIN",
            Verb::NotDefined => "NOT_DEFINED",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a manager or worker process.
///
/// ```text
/// STARTUP -> RUNNING <-> SLEEPING -> STOPPED -> ZOMBIE
///            RUNNING ------------->  STOPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Answer to a verb the receiver does not understand.
    NotDefined,
    Startup,
    Running,
    Sleeping,
    Stopped,
    Zombie,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::NotDefined => "NOT_DEFINED",
            Status::Startup => "STARTUP",
            Status::Running => "RUNNING",
            Status::Sleeping => "SLEEPING",
            Status::Stopped => "STOPPED",
            Status::Zombie => "ZOMBIE",
        };
        f.write_str(name)
    }
}

/// Frames from the host process to its manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerInbound {
    /// Must be the first frame after spawn.
    Init {
        session: SessionId,
        config: ManagerConfig,
    },

    /// One batch of tasks, admitted by the manager in a single step.
    Submit { tasks: Vec<Task> },

    Control(Request<Verb>),
}

/// Frames from a manager to one of its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerInbound {
    /// Must be the first frame after spawn.
    Init {
        session: SessionId,
        name: String,
        poll_interval_ms: u64,
    },

    Execute { task: WorkerTask },

    Control(Request<Verb>),
}

/// Frames from a child (manager or worker) back to its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// Answer to `Init`, echoing its session.
    Ready { session: SessionId },

    Finished { task: FinishedTask },

    Reply(Reply<Status>),
}

impl From<Request<Verb>> for ManagerInbound {
    fn from(request: Request<Verb>) -> Self {
        Self::Control(request)
    }
}

impl From<Request<Verb>> for WorkerInbound {
    fn from(request: Request<Verb>) -> Self {
        Self::Control(request)
    }
}

impl From<Reply<Status>> for Outbound {
    fn from(reply: Reply<Status>) -> Self {
        Self::Reply(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskFault, TaskId, TaskSpec};
    use serde_json::json;

    #[test]
    fn control_request_serializes() {
        let frame = ManagerInbound::Control(Request::new(Verb::Join, CorrelationId::new(4)));
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "control",
          "value": "join",
          "correlation_id": 4
        }
        "#);
    }

    #[test]
    fn reply_serializes() {
        let frame = Outbound::Reply(Reply::new(Status::Sleeping, CorrelationId::new(9)));
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "reply",
          "value": "SLEEPING",
          "correlation_id": 9
        }
        "#);
    }

    #[test]
    fn execute_serializes() {
        let task = Task::new(TaskId::new(2), TaskSpec::new("increment", json!(null)))
            .with_prerequisites(vec![TaskId::new(1)]);
        let frame = WorkerInbound::Execute {
            task: WorkerTask::new(task, vec![json!(2)]),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "execute",
                "task": {
                    "task": {
                        "id": 2,
                        "work": {"kind": "increment", "payload": null},
                        "prerequisites": [1]
                    },
                    "arguments": [2]
                }
            })
        );
    }

    #[test]
    fn finished_fault_serializes() {
        let frame = Outbound::Finished {
            task: FinishedTask::fault(TaskId::new(3), TaskFault::raised("boom")),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "finished",
                "task": {
                    "id": 3,
                    "outcome": {"fault": {"kind": "raised", "message": "boom"}}
                }
            })
        );
    }

    #[test]
    fn unknown_verb_decodes_as_not_defined() {
        let frame: ManagerInbound = serde_json::from_value(json!({
            "type": "control",
            "value": "limit",
            "correlation_id": 1
        }))
        .unwrap();

        match frame {
            ManagerInbound::Control(request) => {
                assert_eq!(request.value, Verb::NotDefined);
                assert_eq!(request.correlation_id, CorrelationId::new(1));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn reply_to_reuses_correlation_id() {
        let request = Request::new(Verb::GetStatus, CorrelationId::new(41));
        let reply = Reply::to(&request, Status::Running);
        assert_eq!(reply.correlation_id, CorrelationId::new(41));
        assert_eq!(reply.value, Status::Running);
    }

    #[test]
    fn correlation_id_wraps() {
        assert_eq!(
            CorrelationId::new(u32::MAX).successor(),
            CorrelationId::new(0)
        );
        assert_eq!(CorrelationId::new(10).to_string(), "0x0A");
    }

    #[test]
    fn status_names_match_wire_format() {
        for status in [
            Status::NotDefined,
            Status::Startup,
            Status::Running,
            Status::Sleeping,
            Status::Stopped,
            Status::Zombie,
        ] {
            let wire = serde_json::to_value(status).unwrap();
            assert_eq!(wire, json!(status.to_string()));
        }
    }
}
