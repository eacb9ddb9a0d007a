//! Out-of-process consumer for the Redis queues.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::{HandlerError, QueueError};
use crate::impls::{ClaimedJob, RedisQueueBackend};
use crate::ports::QueueBackend;
use crate::runtime::{HandlerRegistry, run_handler};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pops jobs from the listed queues, earlier queues first, and runs the
/// handler registered under each job's name.
pub struct DurableWorker {
    backend: RedisQueueBackend,
    registry: Arc<HandlerRegistry>,
    queues: Vec<String>,
    max_retries: u32,
    poll_interval: Duration,
}

impl DurableWorker {
    pub fn new(
        backend: RedisQueueBackend,
        registry: Arc<HandlerRegistry>,
        queues: Vec<String>,
        settings: &Settings,
    ) -> Self {
        Self {
            backend,
            registry,
            queues,
            max_retries: settings.max_retries,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Process jobs until `shutdown_rx` turns `true`. A job in flight is
    /// finished first.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            queues = ?self.queues,
            handlers = ?self.registry.names(),
            max_retries = self.max_retries,
            "durable worker started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(error = %e, "durable worker iteration failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!("durable worker stopped");
    }

    /// Claim and process at most one job. `Ok(false)` when every queue is
    /// empty.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(job) = self.backend.dequeue(&self.queues).await? else {
            return Ok(false);
        };
        self.process(job).await?;
        Ok(true)
    }

    async fn process(&self, job: ClaimedJob) -> Result<(), QueueError> {
        let ClaimedJob { task, attempt } = job;
        let result = match self.registry.get(&task.handler_name) {
            Some(handler) => run_handler(handler.as_ref(), &task).await,
            None => Err(HandlerError::NotFound(task.handler_name.clone())),
        };

        match result {
            Ok(()) => {
                self.backend.ack(&task).await?;
                info!(task_id = %task.id, handler = %task.handler_name, attempt, "job completed");
            }
            Err(err @ HandlerError::NotFound(_)) => {
                self.backend.fail(&task, &err.to_string()).await?;
            }
            Err(err) if attempt <= self.max_retries => {
                warn!(
                    task_id = %task.id,
                    handler = %task.handler_name,
                    attempt,
                    max_retries = self.max_retries,
                    error = %err,
                    "job failed, requeueing"
                );
                self.backend.requeue(&task).await?;
            }
            Err(err) => {
                self.backend.fail(&task, &err.to_string()).await?;
            }
        }
        Ok(())
    }
}
