//! Persistent job definitions.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::tasks::state::TaskStatus;

/// Prefix shared by every archive a job creates.
pub const JOB_ARCHIVE_PREFIX: &str = "Job_";

/// Timestamp suffix format appended to archive names.
const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// What a job does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backup,
    Restore,
    Maintenance,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(Self::Backup),
            "restore" => Ok(Self::Restore),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(JobError::Invalid(format!("unknown job kind '{other}'"))),
        }
    }
}

/// Maintenance operations a job may be scheduled to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaintenanceOp {
    Fsck,
    FsckPrune,
    ListArchives,
    PrintStats,
}

impl FromStr for MaintenanceOp {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fsck" => Ok(Self::Fsck),
            "fsck-prune" => Ok(Self::FsckPrune),
            "list-archives" => Ok(Self::ListArchives),
            "print-stats" => Ok(Self::PrintStats),
            other => Err(JobError::Invalid(format!(
                "unknown maintenance operation '{other}'"
            ))),
        }
    }
}

/// Free-form job options with typed accessors for the keys the scheduler understands.
///
/// Known keys: `append_timestamp`, `exclude` (comma separated), `dry_run`,
/// `restore_dir`, `overwrite`, `keep_newer`, `preserve_paths`, `operation`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobOptions(BTreeMap<String, String>);

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => matches!(v.trim(), "1" | "true" | "yes" | "on"),
            None => default,
        }
    }

    /// Layer `overrides` on top of these options.
    pub fn merged(&self, overrides: &JobOptions) -> JobOptions {
        let mut merged = self.0.clone();
        merged.extend(overrides.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        JobOptions(merged)
    }

    pub fn append_timestamp(&self) -> bool {
        self.flag("append_timestamp", true)
    }

    pub fn dry_run(&self) -> bool {
        self.flag("dry_run", false)
    }

    pub fn excludes(&self) -> Vec<String> {
        self.get("exclude")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn restore_dir(&self) -> Option<PathBuf> {
        self.get("restore_dir").map(PathBuf::from)
    }

    pub fn overwrite(&self) -> bool {
        self.flag("overwrite", false)
    }

    pub fn keep_newer(&self) -> bool {
        self.flag("keep_newer", false)
    }

    pub fn preserve_paths(&self) -> bool {
        self.flag("preserve_paths", false)
    }

    pub fn maintenance_op(&self) -> Result<MaintenanceOp, JobError> {
        self.get("operation")
            .ok_or_else(|| JobError::Invalid("maintenance job needs an 'operation' option".into()))?
            .parse()
    }
}

/// A named, persistent backup/restore/maintenance definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub kind: JobKind,
    /// Paths to back up, in order.
    pub sources: Vec<PathBuf>,
    /// Archive a restore job extracts.
    pub archive: Option<String>,
    pub options: JobOptions,
    /// Cron expression (seconds field included) for unattended runs.
    pub schedule: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<TaskStatus>,
}

impl Job {
    fn new(name: impl Into<String>, kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            sources: Vec::new(),
            archive: None,
            options: JobOptions::new(),
            schedule: None,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            last_status: None,
        }
    }

    /// A backup of `sources`.
    pub fn backup(name: impl Into<String>, sources: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut job = Self::new(name, JobKind::Backup);
        job.sources = sources.into_iter().collect();
        job
    }

    /// A restore of `archive`.
    pub fn restore(name: impl Into<String>, archive: impl Into<String>) -> Self {
        let mut job = Self::new(name, JobKind::Restore);
        job.archive = Some(archive.into());
        job
    }

    /// A recurring maintenance operation.
    pub fn maintenance(name: impl Into<String>, op: MaintenanceOp) -> Self {
        let op = match op {
            MaintenanceOp::Fsck => "fsck",
            MaintenanceOp::FsckPrune => "fsck-prune",
            MaintenanceOp::ListArchives => "list-archives",
            MaintenanceOp::PrintStats => "print-stats",
        };
        Self::new(name, JobKind::Maintenance).with_option("operation", op)
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.set(key, value);
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    /// Check the definition is runnable.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.name.trim().is_empty() {
            return Err(JobError::Invalid("job name must not be empty".into()));
        }
        match self.kind {
            JobKind::Backup if self.sources.is_empty() => {
                return Err(JobError::Invalid(format!(
                    "backup job '{}' has no source paths",
                    self.name
                )));
            }
            JobKind::Restore if self.archive.as_deref().is_none_or(str::is_empty) => {
                return Err(JobError::Invalid(format!(
                    "restore job '{}' has no archive",
                    self.name
                )));
            }
            JobKind::Maintenance => {
                self.options.maintenance_op()?;
            }
            _ => {}
        }
        if let Some(schedule) = &self.schedule {
            parse_schedule(schedule)?;
        }
        Ok(())
    }

    /// Prefix shared by every archive this job creates.
    pub fn archive_prefix(&self) -> String {
        format!("{JOB_ARCHIVE_PREFIX}{}", self.name)
    }

    /// Name for a new backup archive created at `now`.
    pub fn archive_name(&self, options: &JobOptions, now: DateTime<Utc>) -> String {
        let prefix = self.archive_prefix();
        if options.append_timestamp() {
            format!("{prefix}_{}", now.format(ARCHIVE_TIMESTAMP_FORMAT))
        } else {
            prefix
        }
    }

    /// Whether `archive` was produced by this job: the bare prefix, or the
    /// prefix followed by exactly one timestamp suffix. A job named `web`
    /// must not claim `Job_web_prod_...`.
    pub fn owns_archive(&self, archive: &str) -> bool {
        let prefix = self.archive_prefix();
        let Some(rest) = archive.strip_prefix(prefix.as_str()) else {
            return false;
        };
        if rest.is_empty() {
            return true;
        }
        rest.strip_prefix('_').is_some_and(|stamp| {
            NaiveDateTime::parse_from_str(stamp, ARCHIVE_TIMESTAMP_FORMAT).is_ok()
        })
    }

    /// Next time the schedule fires strictly after the last run (or creation).
    pub fn next_run_after_last(&self) -> Result<Option<DateTime<Utc>>, JobError> {
        let Some(schedule) = &self.schedule else {
            return Ok(None);
        };
        let since = self.last_run_at.unwrap_or(self.created_at);
        Ok(parse_schedule(schedule)?.after(&since).next())
    }

    /// Whether a scheduled run is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> Result<bool, JobError> {
        Ok(self.next_run_after_last()?.is_some_and(|next| next <= now))
    }
}

fn parse_schedule(schedule: &str) -> Result<cron::Schedule, JobError> {
    cron::Schedule::from_str(schedule).map_err(|e| JobError::InvalidSchedule {
        schedule: schedule.to_string(),
        reason: e.to_string(),
    })
}
