//! Error types for the task orchestration core.

use std::time::Duration;

use uuid::Uuid;

use crate::tasks::state::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// The external tool could not be launched.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Executable {program} not found")]
    NotFound { program: String },

    #[error("Executable {program} is not executable")]
    PermissionDenied { program: String },

    #[error("Invalid argument for {program}: {reason}")]
    InvalidArgument { program: String, reason: String },

    #[error("Failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl SpawnError {
    /// Classify a `spawn()` I/O failure.
    pub fn from_io(program: impl Into<String>, err: std::io::Error) -> Self {
        let program = program.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { program },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { program },
            std::io::ErrorKind::InvalidInput => Self::InvalidArgument {
                program,
                reason: err.to_string(),
            },
            _ => Self::Io {
                program,
                source: err,
            },
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// A missing or non-executable tool never recovers on its own; resource
    /// exhaustion at fork time (EAGAIN, EMFILE) usually does.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::PermissionDenied { .. } | Self::InvalidArgument { .. } => {
                false
            }
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::OutOfMemory
            ) || source.raw_os_error().is_some_and(is_retryable_errno),
        }
    }
}

#[cfg(unix)]
fn is_retryable_errno(code: i32) -> bool {
    use nix::errno::Errno;
    let errno = Errno::from_raw(code);
    matches!(errno, Errno::EAGAIN | Errno::EMFILE | Errno::ENFILE | Errno::ENOMEM)
}

#[cfg(not(unix))]
fn is_retryable_errno(_code: i32) -> bool {
    false
}

/// Task admission and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Job {job_id} already has an active task")]
    DuplicateActiveJob { job_id: Uuid },

    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} in state {from}, cannot transition to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Invalid task request: {0}")]
    InvalidRequest(String),

    #[error("Task manager is shutting down")]
    ShuttingDown,
}

/// Job definition errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid job definition: {0}")]
    Invalid(String),

    #[error("Invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },
}

/// Account service errors.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("Account credentials not configured")]
    NoCredentials,

    #[error("Account request failed: {0}")]
    Request(String),

    #[error("Account service rejected the request (HTTP {status})")]
    Rejected { status: u16 },

    #[error("Unexpected account report: {0}")]
    Parse(String),

    #[error("Account request timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_is_fatal() {
        let err = SpawnError::from_io(
            "tarsnap",
            std::io::Error::new(std::io::ErrorKind::NotFound, "nope"),
        );
        assert!(matches!(err, SpawnError::NotFound { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn permission_denied_is_fatal() {
        let err = SpawnError::from_io(
            "tarsnap",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_transient());
    }

    #[cfg(unix)]
    #[test]
    fn resource_exhaustion_is_transient() {
        let err = SpawnError::from_io(
            "tarsnap",
            std::io::Error::from_raw_os_error(nix::errno::Errno::EMFILE as i32),
        );
        assert!(matches!(err, SpawnError::Io { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn duplicate_message_names_job() {
        let id = Uuid::new_v4();
        let err = TaskError::DuplicateActiveJob { job_id: id };
        assert!(err.to_string().contains(&id.to_string()));
    }
}
