//! Events broadcast to observers of the task manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account::AccountStatus;
use crate::jobs::Job;
use crate::tasks::parser::{Archive, ArchiveStats};
use crate::tasks::state::{Progress, TaskSnapshot};

/// A timestamped line of the activity journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl JournalEntry {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

/// Why the queue is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    User,
    /// The account ran out of credit; cleared automatically once topped up.
    QuotaExceeded,
}

/// Something observers may want to react to.
///
/// Delivered through a broadcast channel: a slow subscriber that lags loses
/// the oldest events, never blocks the dispatcher.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    JobAdded(Job),
    JobRemoved { job_id: Uuid },
    TaskStatusChanged(TaskSnapshot),
    TaskProgress { task_id: Uuid, progress: Progress },
    ArchiveListUpdated { archives: Vec<Archive> },
    ArchiveUpdated(Archive),
    OverallStatsUpdated(ArchiveStats),
    ToolVersion { version: String },
    JournalAppended(JournalEntry),
    QueuePaused { reason: PauseReason },
    QueueResumed,
    AccountUpdated(AccountStatus),
}
