//! `JobStore` trait: the single async interface for persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::Job;
use crate::tasks::events::JournalEntry;
use crate::tasks::state::{TaskSnapshot, TaskStatus};

/// Backend-agnostic storage for job definitions, task history and the journal.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Insert or replace a job definition.
    async fn put_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Delete a job. Returns whether it existed.
    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// All jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, DatabaseError>;

    /// Record the end of a run on the job row.
    async fn record_job_run(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        status: TaskStatus,
    ) -> Result<(), DatabaseError>;

    // ── Task history ────────────────────────────────────────────────

    /// Persist a terminal task.
    async fn record_task_run(&self, task: &TaskSnapshot) -> Result<(), DatabaseError>;

    /// Most recent runs first, optionally restricted to one job.
    async fn task_runs(
        &self,
        job_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<TaskSnapshot>, DatabaseError>;

    // ── Journal ─────────────────────────────────────────────────────

    async fn append_journal(&self, entry: &JournalEntry) -> Result<(), DatabaseError>;

    /// The last `limit` entries, in chronological order.
    async fn journal(&self, limit: usize) -> Result<Vec<JournalEntry>, DatabaseError>;
}
