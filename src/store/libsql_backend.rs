//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. Structured fields (sources,
//! options, failure reasons) are stored as JSON text columns.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::Job;
use crate::store::migrations;
use crate::store::traits::JobStore;
use crate::tasks::events::JournalEntry;
use crate::tasks::state::{TaskSnapshot, TaskStatus};

const JOB_COLUMNS: &str = "id, name, kind, sources, archive, options, schedule, created_at, updated_at, last_run_at, last_status";

const TASK_RUN_COLUMNS: &str = "id, job_id, label, kind, status, attempt, output, output_truncated, reason, progress, queued_at, started_at, finished_at";

/// Job store on a single reused libSQL connection.
pub struct LibSqlBackend {
    conn: Connection,
    // Owns the database the connection was opened from.
    _db: LibSqlDatabase,
}

impl LibSqlBackend {
    /// Open the database file at `path`, creating it and its directory if
    /// needed, and migrate it.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                DatabaseError::Pool(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        let backend = Self::open(path.as_os_str()).await?;
        info!(path = %path.display(), "Job store ready");
        Ok(backend)
    }

    /// A private in-memory database, migrated and empty.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        Self::open(std::ffi::OsStr::new(":memory:")).await
    }

    async fn open(location: &std::ffi::OsStr) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(location)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("open {location:?}: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("connect {location:?}: {e}")))?;
        let backend = Self { _db: db, conn };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// Rows are written with RFC 3339 timestamps.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp '{s}': {e}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let get = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("job column {i}: {e}")))
    };

    Ok(Job {
        id: parse_uuid(&get(0)?)?,
        name: get(1)?,
        kind: get(2)?
            .parse()
            .map_err(|e: crate::error::JobError| DatabaseError::Serialization(e.to_string()))?,
        sources: from_json(&get(3)?)?,
        archive: row.get::<String>(4).ok(),
        options: from_json(&get(5)?)?,
        schedule: row.get::<String>(6).ok(),
        created_at: parse_datetime(&get(7)?)?,
        updated_at: parse_datetime(&get(8)?)?,
        last_run_at: parse_optional_datetime(row.get::<String>(9).ok())?,
        last_status: row
            .get::<String>(10)
            .ok()
            .and_then(|s| s.parse::<TaskStatus>().ok()),
    })
}

fn row_to_task_run(row: &libsql::Row) -> Result<TaskSnapshot, DatabaseError> {
    let get = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Query(format!("task_runs column {i}: {e}")))
    };

    Ok(TaskSnapshot {
        id: parse_uuid(&get(0)?)?,
        job_id: row
            .get::<String>(1)
            .ok()
            .map(|s| parse_uuid(&s))
            .transpose()?,
        label: get(2)?,
        kind: get(3)?
            .parse()
            .map_err(|e: crate::error::JobError| DatabaseError::Serialization(e.to_string()))?,
        status: get(4)?.parse().map_err(DatabaseError::Serialization)?,
        attempt: row.get::<i64>(5).unwrap_or(0) as u32,
        output: get(6)?,
        output_truncated: row.get::<i64>(7).unwrap_or(0) != 0,
        reason: row
            .get::<String>(8)
            .ok()
            .map(|s| from_json(&s))
            .transpose()?,
        progress: row
            .get::<String>(9)
            .ok()
            .map(|s| from_json(&s))
            .transpose()?,
        queued_at: parse_datetime(&get(10)?)?,
        started_at: parse_optional_datetime(row.get::<String>(11).ok())?,
        finished_at: parse_optional_datetime(row.get::<String>(12).ok())?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn put_job(&self, job: &Job) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    job.id.to_string(),
                    job.name.clone(),
                    job.kind.as_str(),
                    to_json(&job.sources)?,
                    opt_text(job.archive.clone()),
                    to_json(&job.options)?,
                    opt_text(job.schedule.clone()),
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                    opt_text(job.last_run_at.map(|t| t.to_rfc3339())),
                    opt_text(job.last_status.map(|s| s.as_str().to_string())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_job: {e}")))?;

        debug!(job_id = %job.id, name = %job.name, "Job saved");
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_job: {e}")))?;
        Ok(affected > 0)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn record_job_run(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        status: TaskStatus,
    ) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET last_run_at = ?1, last_status = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    at.to_rfc3339(),
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_job_run: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "job".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Task history ────────────────────────────────────────────────

    async fn record_task_run(&self, task: &TaskSnapshot) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO task_runs ({TASK_RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    task.id.to_string(),
                    opt_text(task.job_id.map(|id| id.to_string())),
                    task.label.clone(),
                    task.kind.as_str(),
                    task.status.as_str(),
                    task.attempt as i64,
                    task.output.clone(),
                    task.output_truncated as i64,
                    opt_text(task.reason.as_ref().map(to_json).transpose()?),
                    opt_text(task.progress.as_ref().map(to_json).transpose()?),
                    task.queued_at.to_rfc3339(),
                    opt_text(task.started_at.map(|t| t.to_rfc3339())),
                    opt_text(task.finished_at.map(|t| t.to_rfc3339())),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_task_run: {e}")))?;
        Ok(())
    }

    async fn task_runs(
        &self,
        job_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<TaskSnapshot>, DatabaseError> {
        let mut rows = match job_id {
            Some(job_id) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {TASK_RUN_COLUMNS} FROM task_runs WHERE job_id = ?1 ORDER BY queued_at DESC LIMIT ?2"
                    ),
                    params![job_id.to_string(), limit as i64],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!(
                        "SELECT {TASK_RUN_COLUMNS} FROM task_runs ORDER BY queued_at DESC LIMIT ?1"
                    ),
                    params![limit as i64],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("task_runs: {e}")))?;

        let mut runs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("task_runs: {e}")))?
        {
            runs.push(row_to_task_run(&row)?);
        }
        Ok(runs)
    }

    // ── Journal ─────────────────────────────────────────────────────

    async fn append_journal(&self, entry: &JournalEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO journal (timestamp, message) VALUES (?1, ?2)",
                params![entry.timestamp.to_rfc3339(), entry.message.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_journal: {e}")))?;
        Ok(())
    }

    async fn journal(&self, limit: usize) -> Result<Vec<JournalEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT timestamp, message FROM journal ORDER BY id DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("journal: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("journal: {e}")))?
        {
            let timestamp: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("journal row: {e}")))?;
            let message: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("journal row: {e}")))?;
            entries.push(JournalEntry {
                timestamp: parse_datetime(&timestamp)?,
                message,
            });
        }
        entries.reverse();
        Ok(entries)
    }
}
