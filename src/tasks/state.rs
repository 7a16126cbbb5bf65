//! Task state machine.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;
use crate::jobs::JobKind;
use crate::tasks::parser::ErrorClass;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Admitted to the queue, waiting for a free slot.
    Queued,
    /// Dequeued; the process is being spawned.
    Started,
    /// The process is confirmed live.
    Running,
    /// The process is suspended.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, Started) | (Queued, Cancelled) |
            // From Started (spawn failures skip Running)
            (Started, Running) | (Started, Failed) | (Started, Cancelled) |
            // From Running
            (Running, Completed) | (Running, Failed) |
            (Running, Paused) | (Running, Cancelled) |
            // From Paused
            (Paused, Running) | (Paused, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the task still holds its job's admission slot.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => Self::Queued,
            "started" => Self::Started,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            other => return Err(format!("unknown task status '{other}'")),
        })
    }
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    /// The tool could not be launched.
    Spawn { message: String },
    /// A retryable tool error persisted past the attempt limit.
    Transient {
        class: ErrorClass,
        message: String,
        attempts: u32,
    },
    /// Non-zero exit or a fatal error marker.
    ToolReported {
        class: Option<ErrorClass>,
        exit_code: Option<i32>,
        message: String,
    },
}

impl FailureReason {
    pub fn message(&self) -> &str {
        match self {
            Self::Spawn { message }
            | Self::Transient { message, .. }
            | Self::ToolReported { message, .. } => message,
        }
    }

    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::Spawn { .. } => None,
            Self::Transient { class, .. } => Some(*class),
            Self::ToolReported { class, .. } => *class,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { message } => write!(f, "could not start tool: {message}"),
            Self::Transient {
                message, attempts, ..
            } => write!(f, "{message} (gave up after {attempts} attempts)"),
            Self::ToolReported {
                message,
                exit_code: Some(code),
                ..
            } => write!(f, "{message} (exit code {code})"),
            Self::ToolReported { message, .. } => f.write_str(message),
        }
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub timestamp: DateTime<Utc>,
}

/// Captured tool output with a byte cap.
///
/// Keeps the first half of the budget verbatim and a rolling window of the
/// most recent lines for the second half, so both the command preamble and the
/// trailing error text survive truncation.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    max_bytes: usize,
    head: String,
    tail: VecDeque<String>,
    tail_bytes: usize,
    dropped_bytes: usize,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            head: String::new(),
            tail: VecDeque::new(),
            tail_bytes: 0,
            dropped_bytes: 0,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        let half = self.max_bytes / 2;
        if self.tail.is_empty() && self.head.len() + line.len() < half {
            self.head.push_str(line);
            self.head.push('\n');
            return;
        }

        let kept = floor_truncate(line, half.saturating_sub(1));
        self.dropped_bytes += line.len() - kept.len();
        let line = kept;
        self.tail_bytes += line.len() + 1;
        self.tail.push_back(line);
        while self.tail_bytes > half {
            let Some(removed) = self.tail.pop_front() else {
                break;
            };
            self.tail_bytes -= removed.len() + 1;
            self.dropped_bytes += removed.len() + 1;
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.dropped_bytes > 0
    }

    pub fn render(&self) -> String {
        let mut out = self.head.clone();
        if self.dropped_bytes > 0 {
            out.push_str(&format!("... [truncated {} bytes] ...\n", self.dropped_bytes));
        }
        for line in &self.tail {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Truncate to at most `max` bytes on a char boundary.
fn floor_truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Bytes (and files) processed so far, as reported by the tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub files: u64,
    pub bytes_done: u64,
}

/// Full run state of one task. Owned by the dispatch loop.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub label: String,
    pub kind: JobKind,
    pub status: TaskStatus,
    /// Current attempt, starting at 1 once dispatched.
    pub attempt: u32,
    pub output: OutputBuffer,
    pub reason: Option<FailureReason>,
    pub progress: Option<Progress>,
    pub cancel_requested: bool,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
}

impl TaskRecord {
    pub fn new(
        id: Uuid,
        job_id: Option<Uuid>,
        label: impl Into<String>,
        kind: JobKind,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            id,
            job_id,
            label: label.into(),
            kind,
            status: TaskStatus::Queued,
            attempt: 0,
            output: OutputBuffer::new(max_output_bytes),
            reason: None,
            progress: None,
            cancel_requested: false,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(new_status) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: new_status,
            });
        }

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.status,
            to: new_status,
            timestamp: now,
        });
        self.status = new_status;

        match new_status {
            TaskStatus::Started if self.started_at.is_none() => {
                self.started_at = Some(now);
                self.attempt = 1;
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.finished_at = Some(now);
            }
            _ => {}
        }

        Ok(())
    }

    /// Mark the task failed with `reason`.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), TaskError> {
        self.transition_to(TaskStatus::Failed)?;
        self.reason = Some(reason);
        Ok(())
    }

    /// Append a line of output. Ignored once the task is terminal.
    pub fn push_output(&mut self, line: &str) {
        if !self.status.is_terminal() {
            self.output.push_line(line);
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            job_id: self.job_id,
            label: self.label.clone(),
            kind: self.kind,
            status: self.status,
            attempt: self.attempt,
            output: self.output.render(),
            output_truncated: self.output.is_truncated(),
            reason: self.reason.clone(),
            progress: self.progress,
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Immutable point-in-time view of a task, delivered by value to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub label: String,
    pub kind: JobKind,
    pub status: TaskStatus,
    pub attempt: u32,
    pub output: String,
    pub output_truncated: bool,
    pub reason: Option<FailureReason>,
    pub progress: Option<Progress>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TaskRecord {
        TaskRecord::new(Uuid::new_v4(), None, "test", JobKind::Backup, 4096)
    }

    #[test]
    fn state_transitions_valid() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Started));
        assert!(TaskStatus::Started.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Started.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Started.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Paused.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Started));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }

    #[test]
    fn record_lifecycle_sets_timestamps() {
        let mut rec = record();
        rec.transition_to(TaskStatus::Started).unwrap();
        assert!(rec.started_at.is_some());
        assert_eq!(rec.attempt, 1);
        rec.transition_to(TaskStatus::Running).unwrap();
        rec.transition_to(TaskStatus::Completed).unwrap();
        assert!(rec.finished_at.is_some());
        assert_eq!(rec.transitions.len(), 3);
    }

    #[test]
    fn invalid_transition_reports_states() {
        let mut rec = record();
        let err = rec.transition_to(TaskStatus::Completed).unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition {
                from: TaskStatus::Queued,
                to: TaskStatus::Completed,
                ..
            }
        ));
        assert_eq!(rec.status, TaskStatus::Queued);
    }

    #[test]
    fn output_frozen_after_terminal() {
        let mut rec = record();
        rec.transition_to(TaskStatus::Started).unwrap();
        rec.transition_to(TaskStatus::Running).unwrap();
        rec.push_output("line one");
        rec.fail(FailureReason::ToolReported {
            class: None,
            exit_code: Some(1),
            message: "boom".into(),
        })
        .unwrap();
        rec.push_output("late line");
        let snap = rec.snapshot();
        assert!(snap.output.contains("line one"));
        assert!(!snap.output.contains("late line"));
        assert_eq!(snap.reason.unwrap().to_string(), "boom (exit code 1)");
    }

    #[test]
    fn output_buffer_keeps_head_and_tail() {
        let mut buf = OutputBuffer::new(1024);
        buf.push_line("first line");
        for i in 0..500 {
            buf.push_line(&format!("progress line {i}"));
        }
        buf.push_line("tarsnap: fatal at the end");
        let rendered = buf.render();
        assert!(buf.is_truncated());
        assert!(rendered.starts_with("first line"));
        assert!(rendered.contains("[truncated"));
        assert!(rendered.trim_end().ends_with("tarsnap: fatal at the end"));
        assert!(rendered.len() <= 1024 + 64);
    }

    #[test]
    fn output_buffer_multibyte_safe() {
        let mut buf = OutputBuffer::new(1024);
        let long = "é".repeat(1000);
        buf.push_line(&long);
        assert!(buf.render().len() <= 1024);
    }

    #[test]
    fn status_serde_roundtrip() {
        let json = serde_json::to_string(&TaskStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::Cancelled);
        assert_eq!("paused".parse::<TaskStatus>().unwrap(), TaskStatus::Paused);
    }
}
