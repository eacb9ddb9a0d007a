//! Unified worker: one entry point for every backend.
//!
//! The worker itself never executes tasks. It keeps the process alive,
//! watches the in-memory worker pool when there is one, and turns shutdown
//! signals into an orderly backend shutdown.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::WorkerError;
use crate::ports::{BackendKind, QueueBackend};

const IDLE_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        })
    }
}

/// Wait for SIGINT (Ctrl+C) or, on unix, SIGTERM.
pub async fn wait_for_shutdown_signal() -> std::io::Result<ShutdownSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|()| ShutdownSignal::Interrupt),
            _ = terminate.recv() => Ok(ShutdownSignal::Terminate),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(ShutdownSignal::Interrupt)
    }
}

pub struct UnifiedWorker {
    backend: Arc<dyn QueueBackend>,
    health_check_interval: Duration,
    sync_processing: bool,
    running_tx: watch::Sender<bool>,
    shutdown_requested: AtomicBool,
}

impl UnifiedWorker {
    pub fn new(backend: Arc<dyn QueueBackend>, settings: &Settings) -> Self {
        let (running_tx, _) = watch::channel(false);
        Self {
            backend,
            health_check_interval: settings.health_check_interval(),
            sync_processing: settings.sync_processing,
            running_tx,
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running_tx.borrow()
    }

    /// Whether a shutdown signal has been received.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Run until [`stop`](Self::stop) is called or a shutdown signal arrives.
    ///
    /// Returns at once when a signal was received before the worker started.
    pub async fn start(&self) -> Result<(), WorkerError> {
        if self.shutdown_requested() {
            info!("shutdown already requested, unified worker not started");
            return Ok(());
        }
        if self.running_tx.send_replace(true) {
            return Err(WorkerError::AlreadyRunning);
        }
        let mut running_rx = self.running_tx.subscribe();

        info!(
            backend = %self.backend.kind(),
            sync_processing = self.sync_processing,
            "unified worker started"
        );

        if self.backend.worker_health().is_some() {
            info!(
                interval_secs = self.health_check_interval.as_secs(),
                "monitoring in-memory worker pool"
            );
            while self.wait_while_running(&mut running_rx, self.health_check_interval).await {
                self.check_health();
            }
        } else {
            match self.backend.kind() {
                BackendKind::Redis => {
                    info!("tasks are processed by separate durable workers")
                }
                BackendKind::Memory => info!("tasks run synchronously inside enqueue"),
            }
            while self.wait_while_running(&mut running_rx, IDLE_TICK).await {}
        }

        // a signal that raced with startup leaves the backend running
        if self.running_tx.send_replace(false) {
            self.backend.shutdown().await;
        }
        info!("unified worker loop exited");
        Ok(())
    }

    fn check_health(&self) {
        let Some(health) = self.backend.worker_health() else {
            return;
        };
        if health.is_degraded() {
            warn!(
                alive = health.alive,
                started = health.started,
                "in-memory queue workers have died"
            );
        } else {
            debug!(alive = health.alive, "in-memory queue workers healthy");
        }
    }

    /// Leave the run loop and shut the backend down.
    pub async fn stop(&self) {
        if !self.running_tx.send_replace(false) {
            warn!("stop requested but unified worker is not running");
            return;
        }
        info!("stopping unified worker");
        self.backend.shutdown().await;
        info!("unified worker stopped");
    }

    /// Sleep for `tick` or until stopped. `false` once the worker is stopped
    /// or shutdown was requested.
    async fn wait_while_running(&self, running_rx: &mut watch::Receiver<bool>, tick: Duration) -> bool {
        if !*running_rx.borrow_and_update() || self.shutdown_requested() {
            return false;
        }
        tokio::select! {
            changed = running_rx.changed() => changed.is_ok() && *running_rx.borrow(),
            _ = tokio::time::sleep(tick) => *running_rx.borrow(),
        }
    }

    pub async fn handle_signal(&self, signal: ShutdownSignal) {
        info!(%signal, "received shutdown signal");
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.stop().await;
    }

    /// Spawn a task that stops the worker on SIGINT/SIGTERM.
    pub fn listen_for_signals(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(signal) => worker.handle_signal(signal).await,
                Err(e) => error!(error = %e, "failed to install signal handlers"),
            }
        })
    }
}
