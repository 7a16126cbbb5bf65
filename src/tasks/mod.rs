//! Task orchestration: queueing, process execution, output parsing and
//! lifecycle tracking for tool invocations.

pub mod command;
pub mod events;
pub mod manager;
pub mod parser;
pub mod queue;
pub mod runner;
pub mod schedule;
pub mod state;
pub mod worker;

pub use command::{CommandSpec, Operation, RestoreOptions};
pub use events::{JournalEntry, PauseReason, TaskEvent};
pub use manager::{StopSummary, TaskCounts, TaskManager};
pub use parser::{Archive, ArchiveStats, ErrorClass, OutputParser, ParsedEvent};
pub use queue::TaskHandle;
pub use runner::{ProcessRunner, TokioProcessRunner};
pub use schedule::{BatchSummary, run_all_jobs, spawn_schedule_ticker};
pub use state::{FailureReason, TaskSnapshot, TaskStatus};
