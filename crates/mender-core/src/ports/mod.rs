//! Ports: the seams between the queue core and its collaborators.
//!
//! - `QueueBackend` is implemented by the in-memory and Redis backends.
//! - `Clock` and `IdGenerator` exist so tests can pin time and ids.

pub mod clock;
pub mod id_generator;
pub mod queue_backend;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_backend::{BackendKind, QueueBackend, WorkerHealth};
