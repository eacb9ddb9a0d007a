use std::sync::Arc;

use crate::app::BackendFactory;
use crate::domain::{QUEUE_HEALING, QUEUE_VALIDATION, QUEUE_WEBHOOKS, Task, TaskArgs, TaskId};
use crate::error::QueueError;
use crate::ports::QueueBackend;
use crate::runtime::TaskHandler;

/// Producer-side entry point: one method per well-known queue.
#[derive(Clone)]
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
}

impl QueueManager {
    pub async fn new(factory: &BackendFactory) -> Result<Self, QueueError> {
        Ok(Self::from_backend(factory.get_backend().await?))
    }

    pub fn from_backend(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub async fn enqueue_webhook(
        &self,
        handler: Arc<dyn TaskHandler>,
        args: TaskArgs,
    ) -> Result<Task, QueueError> {
        self.backend.enqueue(QUEUE_WEBHOOKS, handler, args).await
    }

    pub async fn enqueue_validation(
        &self,
        handler: Arc<dyn TaskHandler>,
        args: TaskArgs,
    ) -> Result<Task, QueueError> {
        self.backend.enqueue(QUEUE_VALIDATION, handler, args).await
    }

    pub async fn enqueue_healing(
        &self,
        handler: Arc<dyn TaskHandler>,
        args: TaskArgs,
    ) -> Result<Task, QueueError> {
        self.backend.enqueue(QUEUE_HEALING, handler, args).await
    }

    pub async fn get_task_by_id(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError> {
        self.backend.find_task(task_id).await
    }

    pub async fn get_queue_length(&self, queue_name: &str) -> Result<usize, QueueError> {
        self.backend.queue_length(queue_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::error::HandlerError;
    use crate::impls::InMemoryQueueBackend;
    use crate::runtime::handler_fn;
    use rstest::rstest;
    use std::time::Duration;

    fn noop() -> Arc<dyn TaskHandler> {
        handler_fn("noop", |_, _| async { Ok::<(), HandlerError>(()) })
    }

    #[derive(Debug, Clone, Copy)]
    enum Target {
        Webhook,
        Validation,
        Healing,
    }

    #[rstest]
    #[case(Target::Webhook, "webhooks")]
    #[case(Target::Validation, "validation")]
    #[case(Target::Healing, "healing")]
    #[tokio::test]
    async fn routes_to_fixed_queue(#[case] target: Target, #[case] expected: &str) {
        let factory = BackendFactory::new(Settings::memory(true, 1));
        let manager = QueueManager::new(&factory).await.unwrap();

        let args = TaskArgs::new().arg("payload");
        let task = match target {
            Target::Webhook => manager.enqueue_webhook(noop(), args).await,
            Target::Validation => manager.enqueue_validation(noop(), args).await,
            Target::Healing => manager.enqueue_healing(noop(), args).await,
        }
        .unwrap();

        assert_eq!(task.queue_name, expected);
        assert_eq!(task.handler_name, "noop");
    }

    #[tokio::test]
    async fn looks_up_pending_tasks_and_lengths() {
        let backend = Arc::new(InMemoryQueueBackend::new(&Settings::memory(false, 1)));
        let manager = QueueManager::from_backend(backend.clone());

        // a handler that parks keeps its task pending
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

        let running = manager.enqueue_webhook(parked.clone(), TaskArgs::new()).await.unwrap();
        let queued = manager.enqueue_webhook(parked, TaskArgs::new()).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while manager.get_queue_length(QUEUE_WEBHOOKS).await.unwrap() != 1 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.get_task_by_id(&running.id).await.unwrap(), Some(running.clone()));
        assert_eq!(manager.get_task_by_id(&queued.id).await.unwrap(), Some(queued));
        assert_eq!(manager.get_queue_length(QUEUE_HEALING).await.unwrap(), 0);

        gate.notify_waiters();
        backend.shutdown().await;
    }
}
