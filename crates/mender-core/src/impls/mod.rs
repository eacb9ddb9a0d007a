//! Queue backend implementations.
//!
//! - `InMemoryQueueBackend`: in-process channels plus a worker pool
//! - `RedisQueueBackend`: durable RQ-style layout, consumed by durable workers

mod channel;
pub mod memory;
pub mod redis;

pub use self::memory::{DeadLetter, InMemoryQueueBackend};
pub use self::redis::{ClaimedJob, JobStatus, RedisQueueBackend};
