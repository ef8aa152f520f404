//! Reusable task definitions.
//!
//! A `TaskMethod` names a registered kind once, together with the handlers its
//! results go to, and then stamps out callbacks for any number of payloads.

use std::sync::Arc;

use serde_json::Value;

use crate::client::{ManagerProxy, StagedTask, SubmitError, TaskCallback};
use crate::task::{TaskFault, TaskId, TaskSpec};

type SharedResultHandler = Arc<dyn Fn(Value) + Send + Sync>;
type SharedFaultHandler = Arc<dyn Fn(TaskFault) + Send + Sync>;

#[derive(Clone)]
pub struct TaskMethod {
    kind: String,
    on_result: Option<SharedResultHandler>,
    on_fault: Option<SharedFaultHandler>,
}

impl TaskMethod {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            on_result: None,
            on_fault: None,
        }
    }

    pub fn returning(mut self, on_result: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_result = Some(Arc::new(on_result));
        self
    }

    pub fn on_fault(mut self, on_fault: impl Fn(TaskFault) + Send + Sync + 'static) -> Self {
        self.on_fault = Some(Arc::new(on_fault));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// A one-shot callback running this method on `payload`. Without a result
    /// handler the value is dropped.
    pub fn callback(&self, payload: Value) -> TaskCallback {
        let on_result = self.on_result.clone();
        let callback = TaskCallback::new(TaskSpec::new(self.kind.clone(), payload), move |value| {
            if let Some(on_result) = on_result {
                on_result(value);
            }
        });
        match self.on_fault.clone() {
            Some(on_fault) => callback.with_fault_handler(move |fault| on_fault(fault)),
            None => callback,
        }
    }

    pub fn staged<I, S>(&self, payload: Value, prerequisites: I) -> StagedTask
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StagedTask::new(self.callback(payload)).after(prerequisites)
    }

    /// Submit this method on `payload` as a standalone task.
    pub fn call(&self, proxy: &mut ManagerProxy, payload: Value) -> Result<TaskId, SubmitError> {
        proxy.schedule_task(self.callback(payload))
    }
}

impl std::fmt::Debug for TaskMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskMethod")
            .field("kind", &self.kind)
            .field("has_result_handler", &self.on_result.is_some())
            .field("has_fault_handler", &self.on_fault.is_some())
            .finish()
    }
}

/// Stage a named batch of method calls. Each entry is
/// `(name, method, payload, prerequisite names)`.
pub fn stage_tasks<'m, I, S, P>(
    proxy: &mut ManagerProxy,
    tasks: I,
) -> Result<std::collections::HashMap<String, TaskId>, SubmitError>
where
    I: IntoIterator<Item = (S, &'m TaskMethod, Value, P)>,
    S: Into<String>,
    P: IntoIterator,
    P::Item: Into<String>,
{
    let staged: Vec<(String, StagedTask)> = tasks
        .into_iter()
        .map(|(name, method, payload, prerequisites)| {
            (name.into(), method.staged(payload, prerequisites))
        })
        .collect();
    proxy.schedule_tasks(staged)
}
