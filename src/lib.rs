//! Archivist: task orchestration core for a command-line backup tool.
//!
//! Jobs (backup, restore, maintenance definitions) are stored durably; each
//! run becomes a task that is queued, executed as an external process, parsed
//! and reported through an event feed.

pub mod account;
pub mod config;
pub mod error;
pub mod jobs;
pub mod store;
pub mod tasks;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use jobs::{Job, JobKind, JobOptions};
pub use tasks::TaskManager;
