//! Domain model: task identity, task records and queue names.

pub mod ids;
pub mod task;

pub use self::ids::TaskId;
pub use self::task::{QUEUE_HEALING, QUEUE_VALIDATION, QUEUE_WEBHOOKS, Task, TaskArgs};
