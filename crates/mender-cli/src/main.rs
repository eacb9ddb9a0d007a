mod handlers;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mender_core::app::wait_for_shutdown_signal;
use mender_core::domain::{QUEUE_HEALING, QUEUE_VALIDATION, QUEUE_WEBHOOKS};
use mender_core::impls::{InMemoryQueueBackend, RedisQueueBackend};
use mender_core::{
    BackendFactory, BackendKind, DurableWorker, QueueBackend, QueueError, RegistryError, Settings,
    Task, UnifiedWorker, WorkerError,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "mender", version, about = "Task workers for the documentation-healing bot")]
struct Cli {
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the unified worker for the configured queue backend.
    Worker,

    /// Consume the Redis queues in this process.
    DurableWorker {
        /// Queues to consume, highest priority first.
        #[arg(default_values = [QUEUE_WEBHOOKS, QUEUE_VALIDATION, QUEUE_HEALING])]
        queues: Vec<String>,

        /// Sleep between sweeps of empty queues.
        #[arg(long, default_value_t = 500)]
        poll_interval_ms: u64,
    },

    /// Show queue lengths and the next pending task.
    Inspect {
        #[arg(default_values = [QUEUE_WEBHOOKS, QUEUE_VALIDATION, QUEUE_HEALING])]
        queues: Vec<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to encode output: {0}")]
    Output(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct QueueSummary {
    queue: String,
    length: usize,
    next: Option<Task>,
}

#[derive(Debug, Serialize)]
struct InspectReport {
    backend: BackendKind,
    /// Jobs on the failed list; only Redis keeps one across processes.
    failed: Option<usize>,
    queues: Vec<QueueSummary>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    let result = match cli.command {
        Command::Worker => run_worker().await,
        Command::DurableWorker {
            queues,
            poll_interval_ms,
        } => run_durable_worker(queues, Duration::from_millis(poll_interval_ms)).await,
        Command::Inspect { queues, json } => run_inspect(queues, json).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "mender exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run_worker() -> Result<(), CliError> {
    let settings = Settings::from_env()?;
    info!(
        deployment_mode = %settings.deployment_mode,
        backend = %settings.queue_backend,
        "starting unified worker"
    );

    let factory = BackendFactory::new(settings);
    let backend = factory.get_backend().await?;
    let worker = Arc::new(UnifiedWorker::new(backend, factory.settings()));

    let signals = worker.listen_for_signals();
    let result = worker.start().await;
    signals.abort();

    if let Err(e) = result {
        worker.stop().await;
        return Err(e.into());
    }
    factory.reset_backend().await;

    if worker.shutdown_requested() {
        info!("unified worker shut down on signal");
    }
    Ok(())
}

async fn run_durable_worker(queues: Vec<String>, poll_interval: Duration) -> Result<(), CliError> {
    let settings = Settings::from_env()?;
    let backend = RedisQueueBackend::connect(&settings.redis).await?;
    let registry = Arc::new(handlers::registry()?);
    let worker =
        DurableWorker::new(backend, registry, queues, &settings).with_poll_interval(poll_interval);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(signal) => info!(%signal, "received shutdown signal"),
            Err(e) => error!(error = %e, "failed to install signal handlers"),
        }
        shutdown_tx.send_replace(true);
    });

    worker.run(shutdown_rx).await;
    signals.abort();
    Ok(())
}

async fn run_inspect(queues: Vec<String>, json: bool) -> Result<(), CliError> {
    let settings = Settings::from_env()?;
    let (backend, failed): (Arc<dyn QueueBackend>, Option<usize>) = match settings.queue_backend {
        BackendKind::Redis => {
            let redis = RedisQueueBackend::connect(&settings.redis).await?;
            let failed = redis.failed_count().await?;
            (Arc::new(redis), Some(failed))
        }
        BackendKind::Memory => (Arc::new(InMemoryQueueBackend::new(&settings)), None),
    };
    let factory = BackendFactory::with_backend(settings, backend);
    let backend = factory.get_backend().await?;

    let mut summaries = Vec::with_capacity(queues.len());
    for queue in queues {
        let length = backend.queue_length(&queue).await?;
        let next = backend.get_task(&queue, Some(Duration::ZERO)).await?;
        summaries.push(QueueSummary {
            queue,
            length,
            next,
        });
    }
    factory.reset_backend().await;

    let report = InspectReport {
        backend: backend.kind(),
        failed,
        queues: summaries,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("backend: {}", report.backend);
    if let Some(failed) = report.failed {
        println!("failed:  {failed}");
    }
    println!("{:<16} {:>8}  NEXT", "QUEUE", "LENGTH");
    for summary in &report.queues {
        let next = summary
            .next
            .as_ref()
            .map(|task| format!("{} {}", task.id, task.handler_name))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<16} {:>8}  {}", summary.queue, summary.length, next);
    }
    Ok(())
}
