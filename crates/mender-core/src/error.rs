use thiserror::Error;

use crate::domain::TaskId;

/// Errors raised by queue backends and the components built on them.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to connect to queue broker: {0}")]
    Connection(String),

    #[error("broker operation failed: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("task payload could not be encoded or decoded: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Only produced by synchronous in-memory processing, where the handler
    /// runs inside `enqueue`.
    #[error("task {task_id} ({handler}) failed: {source}")]
    Handler {
        task_id: TaskId,
        handler: String,
        #[source]
        source: HandlerError,
    },

    #[error("stored job {task_id} is malformed: {reason}")]
    MalformedJob { task_id: TaskId, reason: String },

    #[error("queue backend has been shut down")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Errors returned by task handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("no handler registered under `{0}`")]
    NotFound(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler `{0}` is already registered")]
    AlreadyRegistered(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Queue(#[from] QueueError),
}
