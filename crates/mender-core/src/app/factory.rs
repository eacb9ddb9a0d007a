//! Backend selection.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::Settings;
use crate::error::QueueError;
use crate::impls::{InMemoryQueueBackend, RedisQueueBackend};
use crate::ports::{BackendKind, QueueBackend};

/// Owns the settings and the process's queue backend.
///
/// The backend is built on first use and shared afterwards. Independent
/// factories never share state, which is what tests rely on.
pub struct BackendFactory {
    settings: Settings,
    backend: Mutex<Option<Arc<dyn QueueBackend>>>,
}

impl BackendFactory {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            backend: Mutex::new(None),
        }
    }

    /// Factory around an already built backend.
    pub fn with_backend(settings: Settings, backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            settings,
            backend: Mutex::new(Some(backend)),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The shared backend, built from the settings on the first call.
    ///
    /// Failing to reach Redis is returned as-is; a later call tries again.
    pub async fn get_backend(&self) -> Result<Arc<dyn QueueBackend>, QueueError> {
        let mut slot = self.backend.lock().await;
        if let Some(backend) = slot.as_ref() {
            return Ok(Arc::clone(backend));
        }

        let backend: Arc<dyn QueueBackend> = match self.settings.queue_backend {
            BackendKind::Redis => Arc::new(RedisQueueBackend::connect(&self.settings.redis).await?),
            BackendKind::Memory => Arc::new(InMemoryQueueBackend::new(&self.settings)),
        };
        info!(
            backend = %backend.kind(),
            deployment_mode = %self.settings.deployment_mode,
            "queue backend initialized"
        );

        *slot = Some(Arc::clone(&backend));
        Ok(backend)
    }

    /// Drop the shared backend after shutting it down. The next
    /// `get_backend` builds a fresh one.
    pub async fn reset_backend(&self) {
        let previous = self.backend.lock().await.take();
        if let Some(backend) = previous {
            backend.shutdown().await;
            info!(backend = %backend.kind(), "queue backend reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskArgs;
    use crate::error::HandlerError;
    use crate::runtime::handler_fn;

    fn memory_factory() -> BackendFactory {
        BackendFactory::new(Settings::memory(false, 2))
    }

    #[tokio::test]
    async fn memoizes_the_backend() {
        let factory = memory_factory();
        let first = factory.get_backend().await.unwrap();
        let second = factory.get_backend().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), BackendKind::Memory);
        factory.reset_backend().await;
    }

    #[tokio::test]
    async fn reset_builds_a_fresh_backend() {
        let settings = Settings::memory(false, 1);
        // workers are stopped first so the task stays queued
        let backend = Arc::new(InMemoryQueueBackend::new(&settings));
        backend.shutdown().await;
        let factory = BackendFactory::with_backend(settings, backend);

        let first = factory.get_backend().await.unwrap();
        let err = first
            .enqueue("q", handler_fn("noop", |_, _| async { Ok::<(), HandlerError>(()) }), TaskArgs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ShutDown));

        factory.reset_backend().await;
        let second = factory.get_backend().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.queue_length("q").await.unwrap(), 0);
        factory.reset_backend().await;
    }

    #[tokio::test]
    async fn fresh_factories_do_not_share_tasks() {
        // a parked handler keeps its task pending on the first backend
        let gate = Arc::new(tokio::sync::Notify::new());
        let parked = handler_fn("parked", {
            let gate = Arc::clone(&gate);
            move |_, _| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok::<(), HandlerError>(())
                }
            }
        });

        let a = BackendFactory::new(Settings::memory(false, 1));
        let backend_a = a.get_backend().await.unwrap();
        let task = backend_a.enqueue("q", parked, TaskArgs::new()).await.unwrap();
        assert_eq!(backend_a.find_task(&task.id).await.unwrap(), Some(task.clone()));

        let b = BackendFactory::new(Settings::memory(false, 1));
        let backend_b = b.get_backend().await.unwrap();
        assert!(!Arc::ptr_eq(&backend_a, &backend_b));
        assert_eq!(backend_b.find_task(&task.id).await.unwrap(), None);
        assert_eq!(backend_b.queue_length("q").await.unwrap(), 0);

        gate.notify_one();
        a.reset_backend().await;
        b.reset_backend().await;
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let factory = memory_factory();
        factory.reset_backend().await;
        factory.get_backend().await.unwrap();
        factory.reset_backend().await;
        factory.reset_backend().await;
    }

    #[tokio::test]
    async fn unreachable_redis_is_a_connection_error() {
        let mut settings = Settings::default();
        settings.redis.url = Some("redis://127.0.0.1:1/0".to_string());
        let factory = BackendFactory::new(settings);

        let err = factory.get_backend().await.err().unwrap();
        assert!(matches!(err, QueueError::Connection(_)));
    }
}
