//! Cron-driven job runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, TaskError};
use crate::jobs::JobOptions;
use crate::tasks::manager::TaskManager;
use crate::tasks::events::TaskEvent;
use crate::tasks::queue::TaskHandle;
use crate::tasks::state::{TaskSnapshot, TaskStatus};

/// Submit every scheduled job whose next run is due at `now`.
///
/// A job that still has an active task is skipped; it is picked up on a later
/// tick once that task finishes.
pub async fn run_due_jobs(
    manager: &TaskManager,
    now: DateTime<Utc>,
) -> Result<Vec<TaskHandle>, Error> {
    let mut submitted = Vec::new();
    for job in manager.jobs().await? {
        match job.is_due(now) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(job_id = %job.id, "Skipping job with bad schedule: {}", e);
                continue;
            }
        }

        match manager.submit(job.id, job.kind, JobOptions::new()).await {
            Ok(handle) => {
                info!(job_id = %job.id, name = %job.name, "Scheduled run queued");
                submitted.push(handle);
            }
            Err(Error::Task(TaskError::DuplicateActiveJob { .. })) => {
                debug!(job_id = %job.id, "Scheduled run skipped, job already active");
            }
            Err(e) => warn!(job_id = %job.id, "Scheduled run failed to queue: {}", e),
        }
    }
    Ok(submitted)
}

/// Tally of a one-shot run of every job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            _ => self.failed += 1,
        }
    }
}

/// Submit every stored job once and wait until all of them are terminal.
///
/// Jobs that cannot be queued count as failed.
pub async fn run_all_jobs(manager: &TaskManager) -> Result<BatchSummary, Error> {
    let mut events = manager.subscribe();
    let mut summary = BatchSummary::default();
    let mut pending = HashSet::new();
    for job in manager.jobs().await? {
        match manager.submit(job.id, job.kind, JobOptions::new()).await {
            Ok(handle) => {
                pending.insert(handle.task_id);
            }
            Err(e) => {
                error!(job = %job.name, "Failed to queue job: {}", e);
                summary.failed += 1;
            }
        }
    }
    summary.submitted = pending.len();
    info!(jobs = summary.submitted, "Running every job once");

    while !pending.is_empty() {
        match events.recv().await {
            Ok(TaskEvent::TaskStatusChanged(snapshot))
                if snapshot.status.is_terminal() && pending.remove(&snapshot.id) =>
            {
                log_finished(&snapshot);
                summary.record(snapshot.status);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                warn!("Event stream lagged, {} events dropped; polling pending tasks", n);
                settle_pending(manager, &mut pending, &mut summary).await?;
            }
            Err(RecvError::Closed) => {
                warn!(pending = pending.len(), "Task manager stopped before all jobs finished");
                summary.failed += pending.len();
                break;
            }
        }
    }
    Ok(summary)
}

/// Poll every pending task and take the terminal ones off the list.
///
/// A task the manager no longer holds was evicted after finishing; its
/// outcome is unknown here and it counts as failed.
pub async fn settle_pending(
    manager: &TaskManager,
    pending: &mut HashSet<Uuid>,
    summary: &mut BatchSummary,
) -> Result<(), Error> {
    let ids: Vec<Uuid> = pending.iter().copied().collect();
    for id in ids {
        match manager.get_status(id).await {
            Ok(snapshot) if snapshot.status.is_terminal() => {
                pending.remove(&id);
                log_finished(&snapshot);
                summary.record(snapshot.status);
            }
            Ok(_) => {}
            Err(Error::Task(TaskError::NotFound { .. })) => {
                warn!(task_id = %id, "Task outcome no longer available");
                pending.remove(&id);
                summary.failed += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn log_finished(task: &TaskSnapshot) {
    match &task.reason {
        Some(reason) => info!(task_id = %task.id, status = %task.status, "{}: {}", task.label, reason),
        None => info!(task_id = %task.id, status = %task.status, "{}", task.label),
    }
}

/// Spawn a background task that checks schedules every `interval`.
pub fn spawn_schedule_ticker(
    manager: Arc<TaskManager>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Schedule ticker started, checking every {}s", interval.as_secs());
        let mut tick = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Schedule ticker shutting down");
                    return;
                }
                _ = tick.tick() => {}
            }

            if let Err(e) = run_due_jobs(&manager, Utc::now()).await {
                warn!("Schedule check failed: {}", e);
            }
        }
    })
}
