//! Configuration types.
//!
//! The core never reads settings on its own: an [`AppConfig`] is built from a
//! read-only [`Settings`] source and handed to the task manager at construction.
//! A later [`crate::tasks::TaskManager::reload_config`] swaps it for tasks
//! dispatched after the reload.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Read-only key/value access to user settings.
pub trait Settings: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

impl Settings for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Settings read from `ARCHIVIST_*` environment variables.
///
/// `tool_path` is looked up as `ARCHIVIST_TOOL_PATH`, and so on.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSettings;

impl Settings for EnvSettings {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(format!("ARCHIVIST_{}", key.to_ascii_uppercase()))
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

/// Core configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path (or bare name resolved through `PATH`) of the backup tool.
    pub tool_path: PathBuf,
    /// Machine key file passed to every tool invocation.
    pub key_file: Option<PathBuf>,
    /// Tool cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Machine name, used for account activity lookups.
    pub machine_name: Option<String>,
    /// Account login for the provider's web interface.
    pub account_user: Option<String>,
    pub account_password: Option<SecretString>,
    /// Maximum number of simultaneously running tasks.
    pub max_concurrent_tasks: usize,
    /// Attempts per task for retryable failures (including the first one).
    pub max_attempts: u32,
    /// Linear backoff base: attempt N waits N * base.
    pub retry_backoff: Duration,
    /// How long a cancelled process gets between SIGTERM and SIGKILL.
    pub cancel_grace: Duration,
    /// Cap on captured output per task.
    pub max_output_bytes: usize,
    /// Suspend running processes on pause instead of only holding the queue.
    pub suspend_on_pause: bool,
    pub account_poll_interval: Duration,
    pub schedule_tick_interval: Duration,
    /// Terminal task snapshots kept in memory until acknowledged.
    pub history_limit: usize,
    pub db_path: PathBuf,
    /// Directory for rolling log files (logs go to stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tool_path: PathBuf::from("tarsnap"),
            key_file: None,
            cache_dir: None,
            machine_name: None,
            account_user: None,
            account_password: None,
            max_concurrent_tasks: 1,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(10),
            max_output_bytes: 64 * 1024,
            suspend_on_pause: false,
            account_poll_interval: Duration::from_secs(3600), // 1 hour
            schedule_tick_interval: Duration::from_secs(60),
            history_limit: 200,
            db_path: PathBuf::from("./data/archivist.db"),
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Build a config from a settings source, falling back to defaults.
    pub fn from_settings(settings: &dyn Settings) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            tool_path: settings
                .get("tool_path")
                .map(PathBuf::from)
                .unwrap_or(defaults.tool_path),
            key_file: settings.get("key_file").map(PathBuf::from),
            cache_dir: settings.get("cache_dir").map(PathBuf::from),
            machine_name: settings.get("machine_name"),
            account_user: settings.get("account_user"),
            account_password: settings.get("account_password").map(SecretString::from),
            max_concurrent_tasks: parse_or(
                settings,
                "max_concurrent_tasks",
                defaults.max_concurrent_tasks,
            )?,
            max_attempts: parse_or(settings, "max_attempts", defaults.max_attempts)?,
            retry_backoff: millis_or(settings, "retry_backoff_ms", defaults.retry_backoff)?,
            cancel_grace: millis_or(settings, "cancel_grace_ms", defaults.cancel_grace)?,
            max_output_bytes: parse_or(settings, "max_output_bytes", defaults.max_output_bytes)?,
            suspend_on_pause: parse_or(settings, "suspend_on_pause", defaults.suspend_on_pause)?,
            account_poll_interval: Duration::from_secs(parse_or(
                settings,
                "account_poll_secs",
                defaults.account_poll_interval.as_secs(),
            )?),
            schedule_tick_interval: Duration::from_secs(parse_or(
                settings,
                "schedule_tick_secs",
                defaults.schedule_tick_interval.as_secs(),
            )?),
            history_limit: parse_or(settings, "history_limit", defaults.history_limit)?,
            db_path: settings
                .get("db_path")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_dir: settings.get("log_dir").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the scheduler relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tool_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "tool_path".into(),
                hint: "Set ARCHIVIST_TOOL_PATH to the backup tool executable".into(),
            });
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_tasks".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.max_output_bytes < 1024 {
            return Err(ConfigError::InvalidValue {
                key: "max_output_bytes".into(),
                message: "must be at least 1024".into(),
            });
        }
        Ok(())
    }

    /// Whether account polling can run.
    pub fn has_account_credentials(&self) -> bool {
        self.account_user.is_some() && self.account_password.is_some()
    }
}

fn parse_or<T>(settings: &dyn Settings, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match settings.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
        None => Ok(default),
    }
}

fn millis_or(settings: &dyn Settings, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let ms: u64 = parse_or(settings, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}
