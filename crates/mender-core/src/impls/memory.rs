//! In-process queue backend.
//!
//! Tasks live in per-queue FIFO channels and are executed either inline by
//! `enqueue` (synchronous mode) or by a fixed pool of worker tasks that sweep
//! every channel. Nothing survives a restart.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::channel::TaskChannel;
use crate::config::Settings;
use crate::domain::{Task, TaskArgs, TaskId};
use crate::error::QueueError;
use crate::ports::{
    BackendKind, Clock, IdGenerator, QueueBackend, SystemClock, UlidGenerator, WorkerHealth,
};
use crate::runtime::{TaskHandler, run_handler};

/// Upper bound on how long an idle worker sleeps between sweeps.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

const DEAD_LETTER_CAPACITY: usize = 1_000;

/// A task as it sits in a channel: the handler travels with it.
#[derive(Clone)]
struct QueuedTask {
    handler: Arc<dyn TaskHandler>,
    task: Task,
    /// Executions that already failed.
    failures: u32,
}

/// A task that failed for good.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub task: Task,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Default)]
struct BackendState {
    channels: BTreeMap<String, Arc<TaskChannel<QueuedTask>>>,
    /// Enqueued and not yet acked or failed.
    pending: HashMap<TaskId, Task>,
    dead_letters: VecDeque<DeadLetter>,
}

/// State shared between the backend handle and its workers.
struct Shared {
    state: Mutex<BackendState>,
    /// Nudges one idle worker after a push.
    wake: Notify,
    /// `true` once shutdown has been requested.
    shutdown_tx: watch::Sender<bool>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn channel(&self, queue_name: &str) -> Arc<TaskChannel<QueuedTask>> {
        let mut state = self.state();
        Arc::clone(
            state
                .channels
                .entry(queue_name.to_string())
                .or_insert_with(|| Arc::new(TaskChannel::new())),
        )
    }

    /// Pop the next task, starting the sweep at a different queue each time
    /// so one busy queue cannot starve the others.
    fn next_task(&self, offset: usize) -> Option<QueuedTask> {
        let channels: Vec<_> = self.state().channels.values().cloned().collect();
        let count = channels.len();
        (0..count).find_map(|i| channels[offset.wrapping_add(i) % count].try_pop())
    }

    fn ack(&self, task: &Task) {
        if self.state().pending.remove(&task.id).is_none() {
            debug!(task_id = %task.id, "ack for unknown task ignored");
        }
    }

    fn fail(&self, task: &Task, error: &str, attempts: u32) {
        let mut state = self.state();
        if state.pending.remove(&task.id).is_none() {
            debug!(task_id = %task.id, "fail for unknown task ignored");
            return;
        }
        if state.dead_letters.len() == DEAD_LETTER_CAPACITY {
            state.dead_letters.pop_front();
        }
        state.dead_letters.push_back(DeadLetter {
            task: task.clone(),
            error: error.to_string(),
            attempts,
            failed_at: self.clock.now(),
        });
    }

    async fn execute(&self, worker_id: usize, queued: QueuedTask) {
        let QueuedTask {
            handler,
            task,
            failures,
        } = queued;
        debug!(
            worker_id,
            task_id = %task.id,
            handler = %task.handler_name,
            queue = %task.queue_name,
            "processing task"
        );

        match run_handler(handler.as_ref(), &task).await {
            Ok(()) => {
                self.ack(&task);
                info!(worker_id, task_id = %task.id, handler = %task.handler_name, "task completed");
            }
            Err(err) if failures < self.max_retries => {
                warn!(
                    worker_id,
                    task_id = %task.id,
                    handler = %task.handler_name,
                    attempt = failures + 1,
                    max_retries = self.max_retries,
                    error = %err,
                    "task failed, requeueing"
                );
                let channel = self.channel(&task.queue_name);
                channel.push(QueuedTask {
                    handler,
                    task,
                    failures: failures + 1,
                });
                self.wake.notify_one();
            }
            Err(err) => {
                error!(
                    worker_id,
                    task_id = %task.id,
                    handler = %task.handler_name,
                    attempts = failures + 1,
                    error = %err,
                    "task failed"
                );
                self.fail(&task, &err.to_string(), failures + 1);
            }
        }
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<Shared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    debug!(worker_id, "memory queue worker started");

    let mut sweep = worker_id;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let wake = shared.wake.notified();
        tokio::pin!(wake);
        wake.as_mut().enable();

        let next = shared.next_task(sweep);
        sweep = sweep.wrapping_add(1);
        if let Some(queued) = next {
            shared.execute(worker_id, queued).await;
            continue;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = &mut wake => {}
            _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
        }
    }

    debug!(worker_id, "memory queue worker stopped");
}

/// Queue backend that keeps everything in process memory.
///
/// In asynchronous mode the constructor spawns `worker_threads` tokio tasks,
/// so it must be called from inside a runtime. Call
/// [`QueueBackend::shutdown`] to stop them; dropping the backend only signals
/// them.
pub struct InMemoryQueueBackend {
    shared: Arc<Shared>,
    ids: Arc<dyn IdGenerator>,
    sync_processing: bool,
    shutdown_timeout: Duration,
    workers: Mutex<Vec<JoinHandle<()>>>,
    workers_started: usize,
}

impl InMemoryQueueBackend {
    pub fn new(settings: &Settings) -> Self {
        Self::with_ports(
            settings,
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
        )
    }

    pub fn with_ports(
        settings: &Settings,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(BackendState::default()),
            wake: Notify::new(),
            shutdown_tx,
            clock,
            max_retries: settings.max_retries,
        });

        let workers: Vec<JoinHandle<()>> = if settings.sync_processing {
            Vec::new()
        } else {
            (0..settings.worker_threads)
                .map(|worker_id| tokio::spawn(worker_loop(worker_id, Arc::clone(&shared))))
                .collect()
        };

        info!(
            sync_processing = settings.sync_processing,
            workers = workers.len(),
            max_retries = settings.max_retries,
            "memory queue backend initialized"
        );

        Self {
            shared,
            ids,
            sync_processing: settings.sync_processing,
            shutdown_timeout: settings.shutdown_timeout(),
            workers_started: workers.len(),
            workers: Mutex::new(workers),
        }
    }

    /// Tasks enqueued and not yet acked or failed.
    pub fn pending_count(&self) -> usize {
        self.shared.state().pending.len()
    }

    pub fn is_pending(&self, task_id: &TaskId) -> bool {
        self.shared.state().pending.contains_key(task_id)
    }

    /// Most recent permanent failures, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.state().dead_letters.iter().cloned().collect()
    }

    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_inline(&self, handler: Arc<dyn TaskHandler>, task: Task) -> Result<Task, QueueError> {
        debug!(task_id = %task.id, handler = %task.handler_name, "executing task synchronously");
        match run_handler(handler.as_ref(), &task).await {
            Ok(()) => {
                info!(task_id = %task.id, handler = %task.handler_name, "task completed synchronously");
                Ok(task)
            }
            Err(source) => {
                error!(
                    task_id = %task.id,
                    handler = %task.handler_name,
                    error = %source,
                    "synchronous task failed"
                );
                Err(QueueError::Handler {
                    task_id: task.id,
                    handler: task.handler_name,
                    source,
                })
            }
        }
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn enqueue(
        &self,
        queue_name: &str,
        handler: Arc<dyn TaskHandler>,
        args: TaskArgs,
    ) -> Result<Task, QueueError> {
        let task = Task::new(
            self.ids.generate_task_id(),
            handler.name(),
            queue_name,
            args,
            self.shared.clock.now(),
        );

        if self.sync_processing {
            return self.run_inline(handler, task).await;
        }

        if self.shared.is_shut_down() {
            return Err(QueueError::ShutDown);
        }

        let channel = self.shared.channel(queue_name);
        self.shared
            .state()
            .pending
            .insert(task.id.clone(), task.clone());
        channel.push(QueuedTask {
            handler,
            task: task.clone(),
            failures: 0,
        });
        self.shared.wake.notify_one();

        info!(
            task_id = %task.id,
            handler = %task.handler_name,
            queue = queue_name,
            "enqueued task"
        );
        Ok(task)
    }

    async fn get_task(
        &self,
        queue_name: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Task>, QueueError> {
        let channel = self.shared.channel(queue_name);
        Ok(channel.peek(timeout).await.map(|queued| queued.task))
    }

    async fn ack(&self, task: &Task) -> Result<(), QueueError> {
        self.shared.ack(task);
        Ok(())
    }

    async fn fail(&self, task: &Task, error: &str) -> Result<(), QueueError> {
        error!(task_id = %task.id, handler = %task.handler_name, error, "task marked failed");
        self.shared.fail(task, error, 1);
        Ok(())
    }

    async fn find_task(&self, task_id: &TaskId) -> Result<Option<Task>, QueueError> {
        Ok(self.shared.state().pending.get(task_id).cloned())
    }

    async fn queue_length(&self, queue_name: &str) -> Result<usize, QueueError> {
        let channel = self.shared.state().channels.get(queue_name).cloned();
        Ok(channel.map_or(0, |c| c.len()))
    }

    fn worker_health(&self) -> Option<WorkerHealth> {
        if self.sync_processing || self.shared.is_shut_down() {
            return None;
        }
        let alive = self.workers().iter().filter(|h| !h.is_finished()).count();
        Some(WorkerHealth {
            started: self.workers_started,
            alive,
        })
    }

    async fn shutdown(&self) {
        self.shared.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.workers());
        if handles.is_empty() {
            return;
        }

        info!(workers = handles.len(), "stopping memory queue workers");
        for (worker_id, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(worker_id, error = %e, "memory queue worker ended abnormally"),
                Err(_) => warn!(
                    worker_id,
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "memory queue worker did not stop in time"
                ),
            }
        }
        info!("memory queue backend shut down");
    }
}

impl Drop for InMemoryQueueBackend {
    fn drop(&mut self) {
        self.shared.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{QUEUE_VALIDATION, QUEUE_WEBHOOKS};
    use crate::error::HandlerError;
    use crate::ports::FixedClock;
    use crate::runtime::handler_fn;
    use chrono::TimeZone;
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Calls = Arc<Mutex<Vec<Vec<Value>>>>;

    fn recording(name: &str) -> (Arc<dyn TaskHandler>, Calls) {
        let calls: Calls = Arc::default();
        let sink = Arc::clone(&calls);
        let handler = handler_fn(name, move |args, _| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(args);
                Ok::<(), HandlerError>(())
            }
        });
        (handler, calls)
    }

    fn failing(name: &str, counter: Arc<AtomicUsize>) -> Arc<dyn TaskHandler> {
        handler_fn(name, move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(HandlerError::failed("boom"))
            }
        })
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn sync_mode_runs_handler_before_returning() {
        let backend = InMemoryQueueBackend::new(&Settings::memory(true, 4));
        let (handler, calls) = recording("record");

        let task = backend
            .enqueue("q", handler, TaskArgs::new().arg("payload"))
            .await
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![vec![json!("payload")]]);
        assert_eq!(task.handler_name, "record");
        assert_eq!(task.queue_name, "q");
        assert!(!backend.is_pending(&task.id));
        assert_eq!(backend.queue_length("q").await.unwrap(), 0);
        assert!(backend.worker_health().is_none());
    }

    #[tokio::test]
    async fn sync_mode_reports_handler_failure() {
        let backend = InMemoryQueueBackend::new(&Settings::memory(true, 1));
        let counter = Arc::new(AtomicUsize::new(0));

        let err = backend
            .enqueue("q", failing("broken", Arc::clone(&counter)), TaskArgs::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            QueueError::Handler { ref handler, source: HandlerError::Failed(_), .. } if handler == "broken"
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(backend.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_mode_runs_every_task_exactly_once() {
        let backend = InMemoryQueueBackend::new(&Settings::memory(false, 2));
        let (webhook, webhook_calls) = recording("process_github_webhook");
        let (validation, validation_calls) = recording("validate_code_snippet");

        let mut ids = HashSet::new();
        for (queue, handler, n) in [
            (QUEUE_WEBHOOKS, &webhook, 1),
            (QUEUE_WEBHOOKS, &webhook, 2),
            (QUEUE_VALIDATION, &validation, 3),
        ] {
            let task = backend
                .enqueue(queue, Arc::clone(handler), TaskArgs::new().arg(n))
                .await
                .unwrap();
            ids.insert(task.id);
        }
        assert_eq!(ids.len(), 3);

        wait_until(|| webhook_calls.lock().unwrap().len() == 2).await;
        wait_until(|| validation_calls.lock().unwrap().len() == 1).await;
        wait_until(|| backend.pending_count() == 0).await;
        backend.shutdown().await;

        let mut webhook_seen: Vec<i64> = webhook_calls
            .lock()
            .unwrap()
            .iter()
            .map(|args| args[0].as_i64().unwrap())
            .collect();
        webhook_seen.sort();
        assert_eq!(webhook_seen, vec![1, 2]);

        let validation_seen = validation_calls.lock().unwrap();
        assert_eq!(validation_seen.len(), 1);
        assert_eq!(validation_seen[0][0].as_i64(), Some(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_pool_drains_pending_tasks() {
        let backend = InMemoryQueueBackend::new(&Settings::memory(false, 2));
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = handler_fn("count", {
            let counter = Arc::clone(&counter);
            move |_, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            }
        });

        let mut tasks = Vec::new();
        for _ in 0..5 {
            tasks.push(
                backend
                    .enqueue("q", Arc::clone(&handler), TaskArgs::new())
                    .await
                    .unwrap(),
            );
        }

        wait_until(|| counter.load(Ordering::SeqCst) == 5).await;
        wait_until(|| backend.pending_count() == 0).await;
        assert!(tasks.iter().all(|t| !backend.is_pending(&t.id)));
        backend.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_worker_preserves_queue_order() {
        let backend = InMemoryQueueBackend::new(&Settings::memory(false, 1));
        let (handler, calls) = recording("record");

        for n in 0..10 {
            backend
                .enqueue(QUEUE_WEBHOOKS, Arc::clone(&handler), TaskArgs::new().arg(n))
                .await
                .unwrap();
        }

        wait_until(|| calls.lock().unwrap().len() == 10).await;
        let seen: Vec<i64> = calls
            .lock()
            .unwrap()
            .iter()
            .map(|args| args[0].as_i64().unwrap())
            .collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        backend.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_handler_does_not_stop_the_worker() {
        let backend = InMemoryQueueBackend::new(&Settings::memory(false, 1));
        let counter = Arc::new(AtomicUsize::new(0));
        let (ok, calls) = recording("record");

        let bad = backend
            .enqueue("q", failing("broken", Arc::clone(&counter)), TaskArgs::new())
            .await
            .unwrap();
        backend.enqueue("q", ok, TaskArgs::new().arg("after")).await.unwrap();

        wait_until(|| calls.lock().unwrap().len() == 1).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!backend.is_pending(&bad.id));

        let dead = backend.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].task.id, bad.id);
        assert_eq!(dead[0].attempts, 1);
        assert!(dead[0].error.contains("boom"));
        backend.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_handler_is_contained() {
        let backend = InMemoryQueueBackend::new(&Settings::memory(false, 1));
        let (ok, calls) = recording("record");
        let boom = handler_fn("boom", |_, _| async {
            panic!("handler exploded");
            #[allow(unreachable_code)]
            Ok::<(), HandlerError>(())
        });

        backend.enqueue("q", boom, TaskArgs::new()).await.unwrap();
        backend.enqueue("q", ok, TaskArgs::new()).await.unwrap();

        wait_until(|| calls.lock().unwrap().len() == 1).await;
        assert_eq!(backend.worker_health(), Some(WorkerHealth { started: 1, alive: 1 }));
        assert!(backend.dead_letters()[0].error.contains("handler exploded"));
        backend.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retries_until_the_limit_then_dead_letters() {
        let settings = Settings {
            max_retries: 2,
            ..Settings::memory(false, 1)
        };
        let backend = InMemoryQueueBackend::new(&settings);
        let counter = Arc::new(AtomicUsize::new(0));

        backend
            .enqueue("q", failing("flaky", Arc::clone(&counter)), TaskArgs::new())
            .await
            .unwrap();

        wait_until(|| !backend.dead_letters().is_empty()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(backend.dead_letters()[0].attempts, 3);
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn get_task_peeks_without_consuming() {
        let backend = InMemoryQueueBackend::new(&Settings::memory(false, 1));
        backend.shutdown().await;

        // workers are gone, so the queue keeps what is pushed directly
        let (handler, _) = recording("record");
        let task = Task::new(TaskId::new("t-1"), "record", "q", TaskArgs::new(), Utc::now());
        backend.shared.channel("q").push(QueuedTask {
            handler,
            task: task.clone(),
            failures: 0,
        });

        let first = backend.get_task("q", Some(Duration::ZERO)).await.unwrap();
        let second = backend.get_task("q", Some(Duration::ZERO)).await.unwrap();
        assert_eq!(first, Some(task.clone()));
        assert_eq!(second, Some(task));
        assert_eq!(backend.queue_length("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_task_times_out_on_empty_queue() {
        let backend = InMemoryQueueBackend::new(&Settings::memory(true, 1));
        let start = tokio::time::Instant::now();
        let task = backend
            .get_task("empty", Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(task.is_none());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn ack_and_fail_tolerate_unknown_tasks() {
        let backend = InMemoryQueueBackend::new(&Settings::memory(true, 1));
        let stranger = Task::new(TaskId::new("nope"), "h", "q", TaskArgs::new(), Utc::now());

        backend.ack(&stranger).await.unwrap();
        backend.fail(&stranger, "whatever").await.unwrap();
        assert!(backend.dead_letters().is_empty());
        assert!(backend.find_task(&stranger.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let backend = InMemoryQueueBackend::new(&Settings::memory(false, 2));
        backend.shutdown().await;
        backend.shutdown().await;

        let (handler, _) = recording("record");
        let err = backend.enqueue("q", handler, TaskArgs::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::ShutDown));
        assert!(backend.worker_health().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_returns_promptly_when_idle() {
        let backend = InMemoryQueueBackend::new(&Settings::memory(false, 4));
        assert_eq!(backend.worker_health(), Some(WorkerHealth { started: 4, alive: 4 }));

        let start = tokio::time::Instant::now();
        backend.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn tasks_carry_the_injected_clock() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let clock = Arc::new(FixedClock::new(at));
        let backend = InMemoryQueueBackend::with_ports(
            &Settings::memory(true, 1),
            clock,
            Arc::new(UlidGenerator::new(FixedClock::new(at))),
        );
        let (handler, _) = recording("record");

        let task = backend.enqueue("q", handler, TaskArgs::new()).await.unwrap();
        assert_eq!(task.enqueued_at, at);
    }
}
