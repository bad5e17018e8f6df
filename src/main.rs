use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use pipeline_queue::config::QueueConfig;
use pipeline_queue::entity::PipelineTable;
use pipeline_queue::queue::{
    Dispatcher, FunctionRegistry, PassthroughHandler, RetentionCleaner, StaleTaskReaper,
    TaskFunction, TaskQueue, spawn_dispatchers, spawn_reaper_task, spawn_retention_task,
};
use pipeline_queue::store::{LibSqlBackend, QueueStore};

/// Stderr logging, plus a daily rolling file when a log directory is set.
/// The returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pipeline-queue.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = QueueConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("Pipeline Queue v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Dispatchers: {}", config.dispatcher.workers);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn QueueStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| {
                format!("Failed to open database at {}", config.db_path.display())
            })?,
    );

    // ── Queue ────────────────────────────────────────────────────────────
    // LLM invocation lives outside this process; every stage passes through.
    let registry = FunctionRegistry::builder()
        .register_all(TaskFunction::ALL, Arc::new(PassthroughHandler))
        .build();
    let queue = Arc::new(
        TaskQueue::new(
            Arc::clone(&store),
            Arc::new(registry),
            Arc::new(PipelineTable::standard()),
        )
        .with_default_max_retries(config.default_max_retries)
        .with_stale_threshold(config.reaper.stale_threshold),
    );

    let stats = queue.queue_stats().await?;
    tracing::info!(
        total = stats.total,
        stale = stats.stale_count,
        exhausted = stats.exhausted_count,
        "Queue loaded"
    );

    // ── Background loops ─────────────────────────────────────────────────
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&queue),
        config.dispatcher.clone(),
        config.retry,
    ));
    let mut handles = spawn_dispatchers(dispatcher, config.dispatcher.workers);

    let reaper = Arc::new(StaleTaskReaper::new(Arc::clone(&store), config.reaper.clone()));
    handles.push(spawn_reaper_task(reaper));

    let cleaner = Arc::new(RetentionCleaner::new(
        Arc::clone(&store),
        config.retention.clone(),
    ));
    handles.push(spawn_retention_task(cleaner));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, stopping background loops");
    for handle in handles {
        handle.abort();
    }

    Ok(())
}
