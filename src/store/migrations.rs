//! Schema versions for the libSQL store, recorded in `_migrations`.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ascending by version. Never edit a released step; append a new one.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "jobs_and_journal",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                sources TEXT NOT NULL DEFAULT '[]',
                archive TEXT,
                options TEXT NOT NULL DEFAULT '{}',
                schedule TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_run_at TEXT,
                last_status TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);

            CREATE TABLE IF NOT EXISTS journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                message TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "task_runs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS task_runs (
                id TEXT PRIMARY KEY,
                job_id TEXT,
                label TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                output TEXT NOT NULL DEFAULT '',
                output_truncated INTEGER NOT NULL DEFAULT 0,
                reason TEXT,
                progress TEXT,
                queued_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_task_runs_job ON task_runs(job_id);
            CREATE INDEX IF NOT EXISTS idx_task_runs_finished ON task_runs(finished_at);
        "#,
    },
];

/// Bring the schema up to date.
///
/// Each step runs in its own transaction together with its `_migrations`
/// row, so a failed step leaves the database at the previous version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("cannot create version table: {e}")))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Migrating schema");
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            step.sql, step.version, step.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "step {} ({}) failed: {e}",
                step.version, step.name
            )));
        }
    }
    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT IFNULL(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
    else {
        return Ok(0);
    };
    row.get::<i64>(0)
        .map_err(|e| DatabaseError::Migration(e.to_string()))
}
