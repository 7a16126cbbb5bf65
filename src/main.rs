use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use archivist::account::{AccountSync, HttpAccountClient, spawn_account_sync};
use archivist::config::{AppConfig, EnvSettings};
use archivist::store::{JobStore, LibSqlBackend};
use archivist::tasks::{
    TaskEvent, TaskManager, TokioProcessRunner, run_all_jobs, spawn_schedule_ticker,
};

/// Upper bound on a `--jobs` run before giving up on stragglers.
const JOBS_MODE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_settings(&EnvSettings).context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    let jobs_mode = std::env::args().skip(1).any(|a| a == "--jobs" || a == "-j");

    eprintln!("Archivist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Tool: {}", config.tool_path.display());
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Task manager ─────────────────────────────────────────────────────
    let runner = Arc::new(TokioProcessRunner::new(config.cancel_grace));
    let manager = TaskManager::start(config.clone(), Arc::clone(&store), runner)?;

    if jobs_mode {
        let summary = tokio::time::timeout(JOBS_MODE_TIMEOUT, run_all_jobs(&manager))
            .await
            .context("timed out waiting for jobs")??;
        manager.shutdown().await;
        eprintln!(
            "   {} job(s) run: {} completed, {} failed, {} cancelled",
            summary.submitted, summary.completed, summary.failed, summary.cancelled
        );
        if summary.failed > 0 {
            anyhow::bail!("{} job(s) failed", summary.failed);
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let _ticker = spawn_schedule_ticker(
        Arc::clone(&manager),
        config.schedule_tick_interval,
        shutdown.clone(),
    );

    if config.has_account_credentials() {
        let client = HttpAccountClient::from_config(&config)?;
        let sync = AccountSync::new(Arc::new(client), Arc::clone(&manager));
        let _account = spawn_account_sync(sync, config.account_poll_interval, shutdown.clone());
        eprintln!("   Account sync: every {}s", config.account_poll_interval.as_secs());
    }

    if let Err(e) = manager.load_archives().await {
        tracing::warn!("Initial archive listing not queued: {}", e);
    }

    let mut events = manager.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nShutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!("Event log lagged, {} events dropped", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    shutdown.cancel();
    manager.shutdown().await;
    Ok(())
}

/// Log to stderr, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "archivist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn log_event(event: &TaskEvent) {
    match event {
        TaskEvent::TaskStatusChanged(task) => match &task.reason {
            Some(reason) => tracing::info!(task_id = %task.id, status = %task.status, "{}: {}", task.label, reason),
            None => tracing::info!(task_id = %task.id, status = %task.status, "{}", task.label),
        },
        TaskEvent::TaskProgress { task_id, progress } => {
            tracing::debug!(%task_id, files = progress.files, bytes = progress.bytes_done, "Progress");
        }
        TaskEvent::ArchiveListUpdated { archives } => {
            tracing::info!("{} archives on record", archives.len());
        }
        TaskEvent::JournalAppended(entry) => tracing::debug!("journal: {}", entry.message),
        TaskEvent::QueuePaused { reason } => tracing::warn!(?reason, "Queue paused"),
        TaskEvent::AccountUpdated(status) => {
            tracing::info!(credit = %status.credit, as_of = %status.as_of, "Account updated");
        }
        other => tracing::debug!(?other, "Event"),
    }
}
