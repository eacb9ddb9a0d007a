use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::TaskId;

pub const QUEUE_WEBHOOKS: &str = "webhooks";
pub const QUEUE_VALIDATION: &str = "validation";
pub const QUEUE_HEALING: &str = "healing";

/// Positional and keyword arguments for one handler invocation.
///
/// ```ignore
/// let args = TaskArgs::new()
///     .arg("docs/install.md")
///     .kwarg("language", "python");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// A repeated key replaces the earlier value.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// One unit of deferred work.
///
/// Created by a backend's `enqueue`; callers only ever hold a copy. The `id`
/// never changes once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub handler_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub queue_name: String,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: TaskId,
        handler_name: impl Into<String>,
        queue_name: impl Into<String>,
        args: TaskArgs,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            handler_name: handler_name.into(),
            args: args.args,
            kwargs: args.kwargs,
            queue_name: queue_name.into(),
            enqueued_at,
        }
    }
}
