use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};

use crate::domain::Task;
use crate::error::{HandlerError, RegistryError};

/// Business logic run for a task.
///
/// The return value carries no result: handlers report through side effects
/// (persistence, follow-up enqueues).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Name stored with the task; durable workers resolve handlers by it.
    fn name(&self) -> &str;

    async fn handle(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), HandlerError>;
}

/// Handler backed by a closure. Build one with [`handler_fn`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a [`TaskHandler`].
///
/// The closure receives owned copies of the arguments so the returned future
/// can be `'static`.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<(), HandlerError> {
        (self.f)(args.to_vec(), kwargs.clone()).await
    }
}

/// Registry of handlers (name -> handler).
///
/// Built during initialization, then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), RegistryError> {
        let name = handler.name().to_string();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Run `handler` against the task's arguments, turning a panic into
/// [`HandlerError::Panicked`] so the calling worker survives it.
pub(crate) async fn run_handler(handler: &dyn TaskHandler, task: &Task) -> Result<(), HandlerError> {
    match AssertUnwindSafe(handler.handle(&task.args, &task.kwargs))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::Panicked(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
