//! Per-task execution.
//!
//! A worker runs one task to completion: it builds the command, starts the
//! process, streams every line through the parser back to the dispatcher, and
//! applies the retry policy between attempts. Workers never touch task state
//! directly; everything goes through [`WorkerMessage`]s.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::tasks::command::Operation;
use crate::tasks::parser::{ErrorClass, ErrorMarker, OutputParser, ParseMode, ParsedEvent};
use crate::tasks::runner::{ProcessControl, ProcessExit, ProcessRunner, StreamKind};
use crate::tasks::state::FailureReason;

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(FailureReason),
    Cancelled,
}

/// Result of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Done(TaskOutcome),
    /// Worth another attempt. Carries the reason to report if none is left.
    Retry(FailureReason),
}

/// Worker to dispatcher messages.
#[derive(Debug)]
pub enum WorkerMessage {
    Spawned {
        task_id: Uuid,
        attempt: u32,
        control: ProcessControl,
    },
    Output {
        task_id: Uuid,
        line: String,
        event: Option<ParsedEvent>,
    },
    /// A record completed at end of stream.
    Parsed {
        task_id: Uuid,
        event: ParsedEvent,
    },
    Retrying {
        task_id: Uuid,
        next_attempt: u32,
        reason: FailureReason,
        delay: Duration,
    },
    Finished {
        task_id: Uuid,
        outcome: TaskOutcome,
    },
}

pub struct Worker {
    pub task_id: Uuid,
    pub operation: Operation,
    pub config: Arc<AppConfig>,
    pub runner: Arc<dyn ProcessRunner>,
    pub cancel: CancellationToken,
    pub tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl Worker {
    /// Run every attempt and report the outcome.
    pub async fn run(self) {
        let outcome = self.execute().await;
        info!(task_id = %self.task_id, ?outcome, "Task finished");
        let _ = self.tx.send(WorkerMessage::Finished {
            task_id: self.task_id,
            outcome,
        });
    }

    async fn execute(&self) -> TaskOutcome {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let reason = match self.run_attempt(attempt).await {
                AttemptResult::Done(outcome) => return outcome,
                AttemptResult::Retry(reason) => reason,
            };

            if attempt >= max_attempts {
                return TaskOutcome::Failed(with_attempts(reason, attempt));
            }

            let delay = self.config.retry_backoff * attempt;
            warn!(
                task_id = %self.task_id,
                attempt,
                max_attempts,
                ?delay,
                "Attempt failed, retrying: {}", reason
            );
            let _ = self.tx.send(WorkerMessage::Retrying {
                task_id: self.task_id,
                next_attempt: attempt + 1,
                reason,
                delay,
            });

            tokio::select! {
                _ = self.cancel.cancelled() => return TaskOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn run_attempt(&self, attempt: u32) -> AttemptResult {
        if self.cancel.is_cancelled() {
            return AttemptResult::Done(TaskOutcome::Cancelled);
        }

        let spec = match self.operation.build(&self.config) {
            Ok(spec) => spec,
            Err(e) => {
                return AttemptResult::Done(TaskOutcome::Failed(FailureReason::Spawn {
                    message: e.to_string(),
                }));
            }
        };

        let mut handle = match self.runner.run(&spec, self.cancel.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                let reason = FailureReason::Spawn {
                    message: e.to_string(),
                };
                return if e.is_transient() {
                    AttemptResult::Retry(reason)
                } else {
                    AttemptResult::Done(TaskOutcome::Failed(reason))
                };
            }
        };

        debug!(task_id = %self.task_id, attempt, pid = ?handle.pid(), args = ?spec.args, "Attempt started");
        let _ = self.tx.send(WorkerMessage::Spawned {
            task_id: self.task_id,
            attempt,
            control: handle.control(),
        });

        // Records only come from stdout; stderr carries diagnostics and the
        // stats table. Each stream keeps its own multi-line state.
        let mut stdout_parser = OutputParser::new(self.operation.parse_mode());
        let mut stderr_parser = OutputParser::new(ParseMode::Generic);
        let mut markers = Vec::new();
        let mut last_stderr = None;
        let mut lines = handle.take_merged();
        while let Some(line) = lines.next().await {
            let event = match line.stream {
                StreamKind::Stdout => stdout_parser.parse_line(&line.text),
                StreamKind::Stderr => {
                    if !line.text.trim().is_empty() {
                        last_stderr = Some(line.text.clone());
                    }
                    stderr_parser.parse_line(&line.text)
                }
            };
            if let Some(ParsedEvent::ErrorMarker(marker)) = &event {
                markers.push(marker.clone());
            }
            let _ = self.tx.send(WorkerMessage::Output {
                task_id: self.task_id,
                line: line.text,
                event,
            });
        }
        drop(lines);
        for event in [stdout_parser.finish(), stderr_parser.finish()]
            .into_iter()
            .flatten()
        {
            let _ = self.tx.send(WorkerMessage::Parsed {
                task_id: self.task_id,
                event,
            });
        }

        let exit = handle.wait().await;
        classify(exit, &markers, last_stderr.as_deref())
    }
}

/// Decide the result of an attempt from its exit and the error markers seen.
///
/// Specific fatal markers win over everything. Transient markers only matter
/// when the tool also failed; a zero exit means it recovered on its own.
pub fn classify(exit: ProcessExit, markers: &[ErrorMarker], last_stderr: Option<&str>) -> AttemptResult {
    let (code, signal) = match exit {
        ProcessExit::Cancelled => return AttemptResult::Done(TaskOutcome::Cancelled),
        ProcessExit::Exited { code, signal } => (code, signal),
    };
    let success = code == Some(0);

    let fatal = markers
        .iter()
        .rev()
        .find(|m| !m.class.is_transient() && m.class != ErrorClass::Generic);
    if let Some(marker) = fatal {
        return AttemptResult::Done(TaskOutcome::Failed(FailureReason::ToolReported {
            class: Some(marker.class),
            exit_code: code,
            message: marker.message.clone(),
        }));
    }

    if !success {
        if let Some(marker) = markers.iter().rev().find(|m| m.class.is_transient()) {
            return AttemptResult::Retry(FailureReason::Transient {
                class: marker.class,
                message: marker.message.clone(),
                attempts: 1,
            });
        }
    }

    if let Some(marker) = markers.iter().rev().find(|m| m.class == ErrorClass::Generic) {
        return AttemptResult::Done(TaskOutcome::Failed(FailureReason::ToolReported {
            class: Some(ErrorClass::Generic),
            exit_code: code,
            message: marker.message.clone(),
        }));
    }

    if success {
        return AttemptResult::Done(TaskOutcome::Completed);
    }

    let message = match (signal, last_stderr) {
        (Some(signal), _) => format!("terminated by signal {signal}"),
        (None, Some(line)) => line.trim().to_string(),
        (None, None) => "tool reported failure".to_string(),
    };
    AttemptResult::Done(TaskOutcome::Failed(FailureReason::ToolReported {
        class: None,
        exit_code: code,
        message,
    }))
}

fn with_attempts(reason: FailureReason, attempts: u32) -> FailureReason {
    match reason {
        FailureReason::Transient { class, message, .. } => FailureReason::Transient {
            class,
            message,
            attempts,
        },
        other => other,
    }
}
