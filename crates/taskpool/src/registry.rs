//! Task-kind registry.
//!
//! Work never crosses a process boundary as code. A task names a kind; every
//! worker process builds the same registry at start-up and looks the handler
//! up by that name.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::task::TaskFault;

/// What a handler gets: the payload bound at submission and the results of
/// its prerequisites, in declared order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskInput {
    pub payload: Value,
    pub arguments: Vec<Value>,
}

impl TaskInput {
    pub fn new(payload: Value, arguments: Vec<Value>) -> Self {
        Self { payload, arguments }
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, TaskFault> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TaskFault::invalid_input(format!("payload: {e}")))
    }

    /// Positional argument `index`, decoded as `T`.
    pub fn argument<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskFault> {
        let value = self.arguments.get(index).ok_or_else(|| {
            TaskFault::invalid_input(format!(
                "missing argument {index} (got {})",
                self.arguments.len()
            ))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| TaskFault::invalid_input(format!("argument {index}: {e}")))
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, input: TaskInput) -> Result<Value, TaskFault>;
}

/// Synchronous body; runs on the blocking pool so it cannot stall the control protocol.
struct BlockingHandler<F>(Arc<F>);

#[async_trait]
impl<F> TaskHandler for BlockingHandler<F>
where
    F: Fn(TaskInput) -> Result<Value, TaskFault> + Send + Sync + 'static,
{
    async fn run(&self, input: TaskInput) -> Result<Value, TaskFault> {
        let body = Arc::clone(&self.0);
        match tokio::task::spawn_blocking(move || body(input)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TaskFault::new(
                crate::task::FaultKind::Panicked,
                panic_message(e.into_panic()),
            )),
            Err(e) => Err(TaskFault::raised(e.to_string())),
        }
    }
}

type BoxedTaskFuture = Pin<Box<dyn Future<Output = Result<Value, TaskFault>> + Send>>;

struct AsyncHandler<F>(F);

#[async_trait]
impl<F> TaskHandler for AsyncHandler<F>
where
    F: Fn(TaskInput) -> BoxedTaskFuture + Send + Sync + 'static,
{
    async fn run(&self, input: TaskInput) -> Result<Value, TaskFault> {
        (self.0)(input).await
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `kind`, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        let kind = kind.into();
        if self.handlers.insert(kind.clone(), handler).is_some() {
            tracing::debug!(%kind, "Replacing task handler");
        }
        self
    }

    pub fn register_fn<F>(&mut self, kind: impl Into<String>, body: F) -> &mut Self
    where
        F: Fn(TaskInput) -> Result<Value, TaskFault> + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(BlockingHandler(Arc::new(body))))
    }

    pub fn register_async<F, Fut>(&mut self, kind: impl Into<String>, body: F) -> &mut Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskFault>> + Send + 'static,
    {
        let boxed = move |input: TaskInput| -> BoxedTaskFuture { Box::pin(body(input)) };
        self.register(kind, Arc::new(AsyncHandler(boxed)))
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

pub mod demo {
    //! Small arithmetic kinds served by the demo binary and used across the tests.

    use std::time::Duration;

    use super::*;

    pub fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry
            .register_fn("constant", |input| Ok(input.payload))
            .register_fn("increment", |input| {
                let x: i64 = match input.arguments.first() {
                    Some(_) => input.argument(0)?,
                    None => input.payload_as()?,
                };
                Ok(Value::from(x + 1))
            })
            .register_fn("add", |input| {
                let a: i64 = input.argument(0)?;
                let b: i64 = input.argument(1)?;
                Ok(Value::from(a + b))
            })
            .register_fn("fail", |input| {
                Err(TaskFault::raised(
                    input.payload.as_str().unwrap_or("failed").to_string(),
                ))
            })
            .register_fn("panic", |_| panic!("task body panicked"))
            .register_async("sleep", |input| async move {
                let ms: u64 = input.payload_as()?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::from(ms))
            });
        registry
    }
}
