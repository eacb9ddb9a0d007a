//! IdGenerator port.
//!
//! Task ids must stay unique for the lifetime of a backend and be safe to
//! generate from several worker tasks at once, so generators are `Send + Sync`
//! and hold no shared counter.

use crate::domain::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// ULID-based ids: time-sortable, no coordination between processes.
///
/// The timestamp part comes from the injected clock, so a `FixedClock` gives
/// ids that share a timestamp but still differ in their random part.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        TaskId::from(ulid)
    }
}
