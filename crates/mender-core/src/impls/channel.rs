//! FIFO channel with timed peek, one per in-memory queue name.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Unbounded FIFO shared by producers and worker tasks.
///
/// Pops never wait: workers sweep several channels and wait on the backend's
/// wake-up signal instead. Only `peek` waits, so `push` wakes every waiting
/// peeker.
pub(crate) struct TaskChannel<T> {
    items: Mutex<VecDeque<T>>,
    pushed: Notify,
}

impl<T: Clone> TaskChannel<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            pushed: Notify::new(),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, item: T) {
        self.items().push_back(item);
        self.pushed.notify_waiters();
    }

    pub(crate) fn try_pop(&self) -> Option<T> {
        self.items().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.items().len()
    }

    /// Clone of the front item, waiting up to `timeout` for one to arrive.
    ///
    /// `Some(Duration::ZERO)` checks once, `None` waits without bound.
    pub(crate) async fn peek(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // register before checking so a push in between is not missed
            notified.as_mut().enable();

            if let Some(item) = self.items().front().cloned() {
                return Some(item);
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.items().front().cloned();
                    }
                }
            }
        }
    }
}
