//! QueueBackend port.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Task, TaskArgs, TaskId};
use crate::error::QueueError;
use crate::runtime::TaskHandler;

/// Which backend implementation is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Redis-backed durable queue, consumed by out-of-process workers.
    Redis,
    /// In-process queue, lost on restart.
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness sample of a backend-owned worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerHealth {
    pub started: usize,
    pub alive: usize,
}

impl WorkerHealth {
    pub fn is_degraded(&self) -> bool {
        self.alive < self.started
    }
}

/// Queue backend contract, shared by the Redis and in-memory implementations.
///
/// Callers never branch on the concrete type: what differs between backends
/// is exposed through `kind`, `worker_health` and `shutdown`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Register work for `handler` on `queue_name`.
    ///
    /// Returns a copy of the created task with a fresh id.
    async fn enqueue(
        &self,
        queue_name: &str,
        handler: Arc<dyn TaskHandler>,
        args: TaskArgs,
    ) -> Result<Task, QueueError>;

    /// Non-destructive look at the next pending task of `queue_name`.
    ///
    /// `Some(Duration::ZERO)` does not wait, `None` waits until a task shows
    /// up, anything else bounds the wait. An empty queue is `Ok(None)`.
    async fn get_task(
        &self,
        queue_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Task>, QueueError>;

    /// Mark success. Unknown task ids are tolerated.
    async fn ack(&self, task: &Task) -> Result<(), QueueError>;

    /// Mark failure. Unknown task ids are tolerated.
    async fn fail(&self, task: &Task, error: &str) -> Result<(), QueueError>;

    async fn find_task(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError>;

    async fn queue_length(&self, queue_name: &str) -> Result<usize, QueueError>;

    /// `Some` only for backends running a worker pool that can be monitored.
    fn worker_health(&self) -> Option<WorkerHealth> {
        None
    }

    /// Stop backend-owned workers. Must be idempotent.
    async fn shutdown(&self) {}
}
