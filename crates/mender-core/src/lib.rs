//! mender-core
//!
//! Task dispatch for the documentation-healing bot.
//!
//! - **domain**: task model and queue names
//! - **ports**: `QueueBackend`, `Clock`, `IdGenerator`
//! - **impls**: in-memory and Redis backends
//! - **app**: backend factory, queue manager, unified and durable workers
//! - **runtime**: task handlers and the handler registry
//! - **config**: settings read from the environment

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod runtime;

pub use crate::app::{BackendFactory, DurableWorker, QueueManager, ShutdownSignal, UnifiedWorker};
pub use crate::config::Settings;
pub use crate::domain::{Task, TaskArgs, TaskId};
pub use crate::error::{HandlerError, QueueError, RegistryError, WorkerError};
pub use crate::ports::{BackendKind, QueueBackend, WorkerHealth};
pub use crate::runtime::{HandlerRegistry, TaskHandler, handler_fn};
