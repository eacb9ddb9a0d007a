//! Application layer: backend selection, the producer API and the workers.

pub mod durable_worker;
pub mod factory;
pub mod manager;
pub mod worker;

pub use self::durable_worker::DurableWorker;
pub use self::factory::BackendFactory;
pub use self::manager::QueueManager;
pub use self::worker::{ShutdownSignal, UnifiedWorker, wait_for_shutdown_signal};
