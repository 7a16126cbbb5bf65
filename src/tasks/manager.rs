//! Task manager: the single coordinator that owns task lifecycle.
//!
//! All task state lives in one dispatch loop. Callers talk to it through a
//! command channel, workers report through a message channel, and observers
//! receive [`TaskEvent`]s over a broadcast channel. Because the loop is the
//! only writer of task status, no two workers can ever transition the same
//! task concurrently.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{Local, Utc};
use tokio::sync::{RwLock, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::account::AccountStatus;
use crate::config::AppConfig;
use crate::error::{ConfigError, Error, JobError, TaskError};
use crate::jobs::{Job, JobKind, JobOptions};
use crate::store::JobStore;
use crate::tasks::command::{Operation, RestoreOptions};
use crate::tasks::events::{JournalEntry, PauseReason, TaskEvent};
use crate::tasks::parser::{Archive, ArchiveStats, ErrorClass, ParsedEvent, StatsScope};
use crate::tasks::queue::{QueuedTask, TaskHandle, TaskQueue};
use crate::tasks::runner::{ProcessControl, ProcessRunner};
use crate::tasks::state::{Progress, TaskRecord, TaskSnapshot, TaskStatus};
use crate::tasks::worker::{TaskOutcome, Worker, WorkerMessage};

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// Queue and pause state at a glance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub queued: usize,
    pub running: usize,
    pub paused: bool,
}

/// What [`TaskManager::stop_tasks`] cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopSummary {
    pub running: usize,
    pub queued: usize,
}

enum Command {
    Enqueue {
        job_id: Option<Uuid>,
        operation: Operation,
        reply: oneshot::Sender<Result<TaskHandle, Error>>,
    },
    Cancel {
        task_id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    Pause {
        reason: PauseReason,
        reply: oneshot::Sender<()>,
    },
    Resume {
        only_if: Option<PauseReason>,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        running: bool,
        queued: bool,
        reply: oneshot::Sender<StopSummary>,
    },
    Status {
        task_id: Uuid,
        reply: oneshot::Sender<Option<TaskSnapshot>>,
    },
    Tasks {
        reply: oneshot::Sender<Vec<TaskSnapshot>>,
    },
    Acknowledge {
        task_id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    DeleteJob {
        job: Box<Job>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Reload {
        config: Box<AppConfig>,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the dispatch loop.
pub struct TaskManager {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TaskEvent>,
    counts: watch::Receiver<TaskCounts>,
    pause_reason: watch::Receiver<Option<PauseReason>>,
    archives: Arc<RwLock<BTreeMap<String, Archive>>>,
    store: Arc<dyn JobStore>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskManager {
    /// Validate `config` and spawn the dispatch loop.
    pub fn start(
        config: AppConfig,
        store: Arc<dyn JobStore>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (counts_tx, counts_rx) = watch::channel(TaskCounts::default());
        let (pause_tx, pause_rx) = watch::channel(None);
        let archives = Arc::new(RwLock::new(BTreeMap::new()));

        let dispatcher = Dispatcher {
            queue: TaskQueue::new(config.max_concurrent_tasks),
            config: Arc::new(config),
            store: Arc::clone(&store),
            runner,
            records: HashMap::new(),
            running: HashMap::new(),
            history: VecDeque::new(),
            pause_reason: None,
            events: events.clone(),
            counts_tx,
            pause_tx,
            archives: Arc::clone(&archives),
            worker_tx,
            shutting_down: false,
            shutdown_waiters: Vec::new(),
        };
        let handle = tokio::spawn(dispatcher.run(commands_rx, worker_rx));

        Ok(Arc::new(Self {
            commands: commands_tx,
            events,
            counts: counts_rx,
            pause_reason: pause_rx,
            archives,
            store,
            dispatcher: tokio::sync::Mutex::new(Some(handle)),
        }))
    }

    /// Receive every event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, TaskError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| TaskError::ShuttingDown)?;
        rx.await.map_err(|_| TaskError::ShuttingDown)
    }

    // ── Jobs ────────────────────────────────────────────────────────

    /// Validate and persist a job (insert or replace).
    pub async fn add_job(&self, job: Job) -> Result<Job, Error> {
        job.validate()?;
        self.store.put_job(&job).await?;
        info!(job_id = %job.id, name = %job.name, kind = %job.kind, "Job saved");
        let _ = self.events.send(TaskEvent::JobAdded(job.clone()));
        append_journal(
            &*self.store,
            &self.events,
            format!("Job '{}' saved", job.name),
        )
        .await;
        Ok(job)
    }

    pub async fn jobs(&self) -> Result<Vec<Job>, Error> {
        Ok(self.store.list_jobs().await?)
    }

    pub async fn job(&self, id: Uuid) -> Result<Job, Error> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id }.into())
    }

    /// Delete a job. With `purge_archives`, its cached archives are deleted
    /// too; the returned handle tracks that deletion.
    pub async fn delete_job(
        &self,
        id: Uuid,
        purge_archives: bool,
    ) -> Result<Option<TaskHandle>, Error> {
        let job = self.job(id).await?;
        // The check for an active task and the delete run together in the
        // dispatcher, so no task can be queued for the job in between.
        self.request(|reply| Command::DeleteJob {
            job: Box::new(job.clone()),
            reply,
        })
        .await??;
        append_journal(
            &*self.store,
            &self.events,
            format!("Job '{}' deleted", job.name),
        )
        .await;

        if !purge_archives {
            return Ok(None);
        }
        let owned: Vec<String> = self
            .archives
            .read()
            .await
            .keys()
            .filter(|name| job.owns_archive(name))
            .cloned()
            .collect();
        if owned.is_empty() {
            return Ok(None);
        }
        let handle = self.delete_archives(owned).await?;
        Ok(Some(handle))
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Run a stored job. `options` override the job's own.
    pub async fn submit(
        &self,
        job_id: Uuid,
        kind: JobKind,
        options: JobOptions,
    ) -> Result<TaskHandle, Error> {
        let job = self.job(job_id).await?;
        if job.kind != kind {
            return Err(TaskError::InvalidRequest(format!(
                "job '{}' is a {} job, not {}",
                job.name, job.kind, kind
            ))
            .into());
        }
        let options = job.options.merged(&options);
        let operation = Operation::for_job(&job, &options, Utc::now())?;
        let handle = self
            .request(|reply| Command::Enqueue {
                job_id: Some(job_id),
                operation,
                reply,
            })
            .await??;
        Ok(handle)
    }

    /// Back up a job now with its stored options.
    pub async fn backup_now(&self, job_id: Uuid) -> Result<TaskHandle, Error> {
        self.submit(job_id, JobKind::Backup, JobOptions::new()).await
    }

    /// Queue an operation that belongs to no job.
    pub async fn submit_operation(&self, operation: Operation) -> Result<TaskHandle, Error> {
        let handle = self
            .request(|reply| Command::Enqueue {
                job_id: None,
                operation,
                reply,
            })
            .await??;
        Ok(handle)
    }

    pub async fn load_archives(&self) -> Result<TaskHandle, Error> {
        self.submit_operation(Operation::ListArchives).await
    }

    pub async fn load_archive_stats(&self, archive: impl Into<String>) -> Result<TaskHandle, Error> {
        self.submit_operation(Operation::ArchiveStats {
            archive: archive.into(),
        })
        .await
    }

    pub async fn load_archive_contents(
        &self,
        archive: impl Into<String>,
    ) -> Result<TaskHandle, Error> {
        self.submit_operation(Operation::ArchiveContents {
            archive: archive.into(),
        })
        .await
    }

    pub async fn delete_archives(&self, archives: Vec<String>) -> Result<TaskHandle, Error> {
        if archives.is_empty() {
            return Err(TaskError::InvalidRequest("no archives to delete".into()).into());
        }
        self.submit_operation(Operation::DeleteArchives { archives })
            .await
    }

    pub async fn repair_cache(&self, prune: bool) -> Result<TaskHandle, Error> {
        self.submit_operation(Operation::RepairCache { prune }).await
    }

    /// Delete every archive of this machine.
    pub async fn purge_archives(&self) -> Result<TaskHandle, Error> {
        self.submit_operation(Operation::Purge).await
    }

    pub async fn overall_stats(&self) -> Result<TaskHandle, Error> {
        self.submit_operation(Operation::OverallStats).await
    }

    pub async fn tool_version(&self) -> Result<TaskHandle, Error> {
        self.submit_operation(Operation::Version).await
    }

    pub async fn restore_archive(
        &self,
        archive: impl Into<String>,
        options: RestoreOptions,
    ) -> Result<TaskHandle, Error> {
        self.submit_operation(Operation::Restore {
            archive: archive.into(),
            options,
        })
        .await
    }

    // ── Control ─────────────────────────────────────────────────────

    /// Request cancellation. Returns whether a non-terminal task was found;
    /// the terminal `Cancelled` state arrives through the event feed.
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool, Error> {
        Ok(self.request(|reply| Command::Cancel { task_id, reply }).await?)
    }

    /// Hold dispatch of queued tasks.
    pub async fn pause_all(&self, reason: PauseReason) -> Result<(), Error> {
        Ok(self.request(|reply| Command::Pause { reason, reply }).await?)
    }

    /// Lift a pause. Returns whether the queue was paused.
    pub async fn resume_all(&self) -> Result<bool, Error> {
        Ok(self
            .request(|reply| Command::Resume {
                only_if: None,
                reply,
            })
            .await?)
    }

    /// Lift the pause only if it was imposed for `reason`.
    pub async fn resume_if_paused_for(&self, reason: PauseReason) -> Result<bool, Error> {
        Ok(self
            .request(|reply| Command::Resume {
                only_if: Some(reason),
                reply,
            })
            .await?)
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        *self.pause_reason.borrow()
    }

    /// Cancel running and/or queued tasks.
    pub async fn stop_tasks(&self, running: bool, queued: bool) -> Result<StopSummary, Error> {
        Ok(self
            .request(|reply| Command::Stop {
                running,
                queued,
                reply,
            })
            .await?)
    }

    /// Point-in-time view of a task still held in memory.
    pub async fn get_status(&self, task_id: Uuid) -> Result<TaskSnapshot, Error> {
        self.request(|reply| Command::Status { task_id, reply })
            .await?
            .ok_or_else(|| TaskError::NotFound { id: task_id }.into())
    }

    /// Every task held in memory, oldest first.
    pub async fn tasks(&self) -> Result<Vec<TaskSnapshot>, Error> {
        Ok(self.request(|reply| Command::Tasks { reply }).await?)
    }

    /// Drop a terminal task from memory. Returns whether one was removed.
    pub async fn acknowledge(&self, task_id: Uuid) -> Result<bool, Error> {
        Ok(self
            .request(|reply| Command::Acknowledge { task_id, reply })
            .await?)
    }

    pub fn task_counts(&self) -> TaskCounts {
        *self.counts.borrow()
    }

    /// Watch queue counts change.
    pub fn watch_counts(&self) -> watch::Receiver<TaskCounts> {
        self.counts.clone()
    }

    /// Archives as last reported by the tool.
    pub async fn archives(&self) -> Vec<Archive> {
        self.archives.read().await.values().cloned().collect()
    }

    pub async fn archive(&self, name: &str) -> Option<Archive> {
        self.archives.read().await.get(name).cloned()
    }

    pub async fn journal(&self, limit: usize) -> Result<Vec<JournalEntry>, Error> {
        Ok(self.store.journal(limit).await?)
    }

    /// Persisted terminal tasks, newest first.
    pub async fn task_history(
        &self,
        job_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<TaskSnapshot>, Error> {
        Ok(self.store.task_runs(job_id, limit).await?)
    }

    /// Replace the configuration for tasks dispatched from now on.
    pub async fn reload_config(&self, config: AppConfig) -> Result<(), Error> {
        config.validate()?;
        Ok(self
            .request(|reply| Command::Reload {
                config: Box::new(config),
                reply,
            })
            .await?)
    }

    /// Forward an account report to observers.
    pub fn publish_account(&self, status: AccountStatus) {
        let _ = self.events.send(TaskEvent::AccountUpdated(status));
    }

    /// Cancel everything and stop the dispatch loop once workers have exited.
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            debug!("Dispatch loop already stopped");
        }
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Dispatch loop panicked: {}", e);
            }
        }
    }
}

/// Persist a journal line and announce it.
async fn append_journal(
    store: &dyn JobStore,
    events: &broadcast::Sender<TaskEvent>,
    message: String,
) {
    let entry = JournalEntry::now(message);
    if let Err(e) = store.append_journal(&entry).await {
        warn!("Failed to persist journal entry: {}", e);
    }
    let _ = events.send(TaskEvent::JournalAppended(entry));
}

/// Records parsed from a task's output, applied once it completes.
#[derive(Debug, Default)]
struct OperationResults {
    listing: Vec<Archive>,
    stats: Vec<ArchiveStats>,
    contents: Vec<String>,
    version: Option<String>,
}

struct RunningTask {
    operation: Operation,
    cancel: CancellationToken,
    control: Option<ProcessControl>,
    results: OperationResults,
}

/// The dispatch loop's state. Exclusively owned by the loop task.
struct Dispatcher {
    config: Arc<AppConfig>,
    store: Arc<dyn JobStore>,
    runner: Arc<dyn ProcessRunner>,
    queue: TaskQueue<Operation>,
    records: HashMap<Uuid, TaskRecord>,
    running: HashMap<Uuid, RunningTask>,
    /// Terminal task ids, oldest first.
    history: VecDeque<Uuid>,
    pause_reason: Option<PauseReason>,
    events: broadcast::Sender<TaskEvent>,
    counts_tx: watch::Sender<TaskCounts>,
    pause_tx: watch::Sender<Option<PauseReason>>,
    archives: Arc<RwLock<BTreeMap<String, Archive>>>,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    ) {
        info!(
            max_concurrent = self.config.max_concurrent_tasks,
            "Task dispatcher started"
        );
        let mut commands_open = true;

        loop {
            tokio::select! {
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        commands_open = false;
                        self.begin_shutdown().await;
                    }
                },
                Some(msg) = worker_rx.recv() => self.handle_worker_message(msg).await,
            }

            if self.shutting_down && self.running.is_empty() {
                break;
            }
            self.dispatch().await;
            self.publish_counts();
        }

        self.publish_counts();
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!("Task dispatcher stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue {
                job_id,
                operation,
                reply,
            } => {
                let result = match job_id {
                    Some(job_id) => self.enqueue_for_job(job_id, operation).await,
                    None => self.enqueue(None, operation).map_err(Error::from),
                };
                self.publish_counts();
                let _ = reply.send(result);
            }
            Command::Cancel { task_id, reply } => {
                let accepted = self.cancel(task_id).await;
                self.publish_counts();
                let _ = reply.send(accepted);
            }
            Command::Pause { reason, reply } => {
                self.pause(reason).await;
                self.publish_counts();
                let _ = reply.send(());
            }
            Command::Resume { only_if, reply } => {
                let resumed = self.resume(only_if).await;
                self.dispatch().await;
                self.publish_counts();
                let _ = reply.send(resumed);
            }
            Command::Stop {
                running,
                queued,
                reply,
            } => {
                let summary = self.stop(running, queued).await;
                self.publish_counts();
                let _ = reply.send(summary);
            }
            Command::Status { task_id, reply } => {
                let _ = reply.send(self.records.get(&task_id).map(TaskRecord::snapshot));
            }
            Command::Tasks { reply } => {
                let mut tasks: Vec<_> = self.records.values().map(TaskRecord::snapshot).collect();
                tasks.sort_by_key(|t| t.queued_at);
                let _ = reply.send(tasks);
            }
            Command::Acknowledge { task_id, reply } => {
                let removed = match self.records.get(&task_id) {
                    Some(record) if record.status.is_terminal() => {
                        self.records.remove(&task_id);
                        self.history.retain(|id| *id != task_id);
                        true
                    }
                    _ => false,
                };
                let _ = reply.send(removed);
            }
            Command::DeleteJob { job, reply } => {
                let _ = reply.send(self.delete_job(&job).await);
            }
            Command::Reload { config, reply } => {
                self.queue.set_max_running(config.max_concurrent_tasks);
                self.config = Arc::new(*config);
                info!(
                    max_concurrent = self.config.max_concurrent_tasks,
                    "Configuration reloaded"
                );
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.shutdown_waiters.push(reply);
                self.begin_shutdown().await;
            }
        }
    }

    /// Queue a task for a stored job, refusing jobs deleted since the
    /// caller looked them up.
    async fn enqueue_for_job(
        &mut self,
        job_id: Uuid,
        operation: Operation,
    ) -> Result<TaskHandle, Error> {
        if self.store.get_job(job_id).await?.is_none() {
            return Err(JobError::NotFound { id: job_id }.into());
        }
        Ok(self.enqueue(Some(job_id), operation)?)
    }

    async fn delete_job(&mut self, job: &Job) -> Result<(), Error> {
        if let Some(task_id) = self.queue.active_task_for(job.id) {
            return Err(TaskError::InvalidRequest(format!(
                "job '{}' has an active task {task_id}",
                job.name
            ))
            .into());
        }
        self.store.delete_job(job.id).await?;
        let _ = self.events.send(TaskEvent::JobRemoved { job_id: job.id });
        Ok(())
    }

    fn enqueue(
        &mut self,
        job_id: Option<Uuid>,
        operation: Operation,
    ) -> Result<TaskHandle, TaskError> {
        if self.shutting_down {
            return Err(TaskError::ShuttingDown);
        }
        let task_id = Uuid::new_v4();
        let kind = operation.kind();
        let label = operation.label();
        let handle = self.queue.enqueue(QueuedTask {
            task_id,
            job_id,
            kind,
            payload: operation,
        })?;

        self.records.insert(
            task_id,
            TaskRecord::new(task_id, job_id, &label, kind, self.config.max_output_bytes),
        );
        debug!(%task_id, ?job_id, %label, "Task queued");
        self.publish(task_id);
        Ok(handle)
    }

    /// Start queued tasks while slots are free.
    async fn dispatch(&mut self) {
        if self.shutting_down {
            return;
        }
        while let Some(task) = self.queue.dequeue_next() {
            self.start_task(task).await;
        }
    }

    async fn start_task(&mut self, task: QueuedTask<Operation>) {
        let task_id = task.task_id;
        let Some(record) = self.records.get_mut(&task_id) else {
            error!(%task_id, "Dequeued task has no record");
            self.queue.finish(task_id);
            return;
        };
        if let Err(e) = record.transition_to(TaskStatus::Started) {
            error!(%task_id, "Cannot start task: {}", e);
            self.queue.finish(task_id);
            return;
        }
        let label = record.label.clone();
        self.publish(task_id);

        let cancel = CancellationToken::new();
        let worker = Worker {
            task_id,
            operation: task.payload.clone(),
            config: Arc::clone(&self.config),
            runner: Arc::clone(&self.runner),
            cancel: cancel.clone(),
            tx: self.worker_tx.clone(),
        };
        self.running.insert(
            task_id,
            RunningTask {
                operation: task.payload,
                cancel,
                control: None,
                results: OperationResults::default(),
            },
        );
        tokio::spawn(worker.run());

        info!(%task_id, %label, "Task started");
        self.journal(format!("{label}: started")).await;
    }

    async fn handle_worker_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Spawned {
                task_id,
                attempt,
                control,
            } => self.on_spawned(task_id, attempt, control),
            WorkerMessage::Output {
                task_id,
                line,
                event,
            } => {
                if let Some(record) = self.records.get_mut(&task_id) {
                    record.push_output(&line);
                }
                if let Some(event) = event {
                    self.on_parsed(task_id, event).await;
                }
            }
            WorkerMessage::Parsed { task_id, event } => self.on_parsed(task_id, event).await,
            WorkerMessage::Retrying {
                task_id,
                next_attempt,
                reason,
                delay,
            } => {
                if let Some(running) = self.running.get_mut(&task_id) {
                    running.control = None;
                    running.results = OperationResults::default();
                }
                let Some(record) = self.records.get_mut(&task_id) else {
                    return;
                };
                record.attempt = next_attempt;
                let label = record.label.clone();
                self.publish(task_id);
                self.journal(format!(
                    "{label}: attempt {} failed ({reason}), retrying in {}s",
                    next_attempt - 1,
                    delay.as_secs()
                ))
                .await;
            }
            WorkerMessage::Finished { task_id, outcome } => self.finalize(task_id, outcome).await,
        }
    }

    fn on_spawned(&mut self, task_id: Uuid, attempt: u32, control: ProcessControl) {
        let Some(record) = self.records.get_mut(&task_id) else {
            return;
        };
        record.attempt = attempt;
        if record.status == TaskStatus::Started {
            if let Err(e) = record.transition_to(TaskStatus::Running) {
                error!(%task_id, "{}", e);
            }
        }
        if let Some(running) = self.running.get_mut(&task_id) {
            running.control = Some(control);
        }
        if self.pause_reason.is_some() && self.config.suspend_on_pause {
            self.suspend(task_id);
        }
        self.publish(task_id);
    }

    async fn on_parsed(&mut self, task_id: Uuid, event: ParsedEvent) {
        match event {
            ParsedEvent::ProgressTick { files, bytes_done } => {
                let progress = Progress { files, bytes_done };
                if let Some(record) = self.records.get_mut(&task_id) {
                    record.progress = Some(progress);
                }
                let _ = self
                    .events
                    .send(TaskEvent::TaskProgress { task_id, progress });
            }
            ParsedEvent::ErrorMarker(marker) => {
                if marker.class == ErrorClass::QuotaExceeded {
                    warn!(%task_id, "Account balance exhausted, pausing queue");
                    self.pause(PauseReason::QuotaExceeded).await;
                }
            }
            other => {
                let Some(running) = self.running.get_mut(&task_id) else {
                    return;
                };
                let results = &mut running.results;
                match other {
                    ParsedEvent::ArchiveListed(archive) => results.listing.push(archive),
                    ParsedEvent::StatsReported(stats) => results.stats.push(stats),
                    ParsedEvent::ContentEntry(entry) => results.contents.push(entry),
                    ParsedEvent::ToolVersion(version) => results.version = Some(version),
                    ParsedEvent::ProgressTick { .. } | ParsedEvent::ErrorMarker(_) => {}
                }
            }
        }
    }

    async fn finalize(&mut self, task_id: Uuid, outcome: TaskOutcome) {
        let running = self.running.remove(&task_id);
        self.queue.finish(task_id);

        let Some(record) = self.records.get_mut(&task_id) else {
            error!(%task_id, "Finished task has no record");
            return;
        };

        // Completion and failure are only reachable from Running.
        if record.status == TaskStatus::Paused && outcome != TaskOutcome::Cancelled {
            let _ = record.transition_to(TaskStatus::Running);
        }
        let result = match outcome {
            TaskOutcome::Completed => record.transition_to(TaskStatus::Completed),
            TaskOutcome::Failed(reason) => record.fail(reason),
            TaskOutcome::Cancelled => record.transition_to(TaskStatus::Cancelled),
        };
        if let Err(e) = result {
            error!(%task_id, "Invalid final transition: {}", e);
        }
        let status = record.status;
        self.publish(task_id);

        if status == TaskStatus::Completed {
            if let Some(running) = running {
                self.apply_results(running.operation, running.results).await;
            }
        }
        self.complete_record(task_id).await;
    }

    /// Persist a terminal task, journal it and retire it to history.
    async fn complete_record(&mut self, task_id: Uuid) {
        let Some(snapshot) = self.records.get(&task_id).map(TaskRecord::snapshot) else {
            return;
        };

        if let Err(e) = self.store.record_task_run(&snapshot).await {
            warn!(%task_id, "Failed to persist task run: {}", e);
        }
        if let Some(job_id) = snapshot.job_id {
            let at = snapshot.finished_at.unwrap_or_else(Utc::now);
            if let Err(e) = self.store.record_job_run(job_id, at, snapshot.status).await {
                warn!(%job_id, "Failed to record job run: {}", e);
            }
        }

        let message = match (&snapshot.status, &snapshot.reason) {
            (TaskStatus::Failed, Some(reason)) => format!("{}: failed: {reason}", snapshot.label),
            (status, _) => format!("{}: {status}", snapshot.label),
        };
        info!(%task_id, status = %snapshot.status, "{}", message);
        self.journal(message).await;

        self.history.push_back(task_id);
        while self.history.len() > self.config.history_limit {
            if let Some(old) = self.history.pop_front() {
                self.records.remove(&old);
            }
        }
    }

    /// Fold a completed operation's parsed records into the archive cache.
    async fn apply_results(&mut self, operation: Operation, results: OperationResults) {
        let overall = results
            .stats
            .iter()
            .find(|s| s.scope == StatsScope::AllArchives)
            .cloned();

        match operation {
            Operation::ListArchives => {
                let mut cache = self.archives.write().await;
                let mut fresh = BTreeMap::new();
                for mut archive in results.listing {
                    if let Some(old) = cache.get(&archive.name) {
                        archive.size_total = old.size_total;
                        archive.size_compressed = old.size_compressed;
                        archive.size_unique_total = old.size_unique_total;
                        archive.size_unique = old.size_unique;
                        archive.contents = old.contents.clone();
                    }
                    fresh.insert(archive.name.clone(), archive);
                }
                *cache = fresh;
                let archives = cache.values().cloned().collect();
                drop(cache);
                let _ = self.events.send(TaskEvent::ArchiveListUpdated { archives });
            }
            Operation::Backup {
                archive, dry_run, ..
            } => {
                if !dry_run {
                    let mut created = Archive::named(&archive);
                    created.created_at = Some(Local::now().naive_local());
                    if let Some(stats) = results
                        .stats
                        .iter()
                        .find(|s| s.scope == StatsScope::ThisArchive)
                    {
                        created.apply_stats(stats);
                    }
                    self.archives
                        .write()
                        .await
                        .insert(archive, created.clone());
                    let _ = self.events.send(TaskEvent::ArchiveUpdated(created));
                }
            }
            Operation::ArchiveStats { archive } => {
                let stats = results
                    .stats
                    .iter()
                    .find(|s| s.scope != StatsScope::AllArchives);
                if let Some(stats) = stats {
                    let mut cache = self.archives.write().await;
                    let entry = cache
                        .entry(archive.clone())
                        .or_insert_with(|| Archive::named(&archive));
                    entry.apply_stats(stats);
                    let updated = entry.clone();
                    drop(cache);
                    let _ = self.events.send(TaskEvent::ArchiveUpdated(updated));
                }
            }
            Operation::ArchiveContents { archive } => {
                let mut cache = self.archives.write().await;
                let entry = cache
                    .entry(archive.clone())
                    .or_insert_with(|| Archive::named(&archive));
                entry.contents = Some(results.contents);
                let updated = entry.clone();
                drop(cache);
                let _ = self.events.send(TaskEvent::ArchiveUpdated(updated));
            }
            Operation::DeleteArchives { archives } => {
                let mut cache = self.archives.write().await;
                for name in &archives {
                    cache.remove(name);
                }
                let archives = cache.values().cloned().collect();
                drop(cache);
                let _ = self.events.send(TaskEvent::ArchiveListUpdated { archives });
            }
            Operation::Purge => {
                self.archives.write().await.clear();
                let _ = self.events.send(TaskEvent::ArchiveListUpdated {
                    archives: Vec::new(),
                });
            }
            Operation::RepairCache { .. } => {
                // The cache was rebuilt from server state; refresh the listing.
                if let Err(e) = self.enqueue(None, Operation::ListArchives) {
                    debug!("Archive refresh after repair not queued: {}", e);
                }
            }
            Operation::Version => {
                if let Some(version) = results.version {
                    let _ = self.events.send(TaskEvent::ToolVersion { version });
                }
            }
            Operation::OverallStats | Operation::Restore { .. } => {}
        }

        if let Some(stats) = overall {
            let _ = self.events.send(TaskEvent::OverallStatsUpdated(stats));
        }
    }

    async fn cancel(&mut self, task_id: Uuid) -> bool {
        if self.queue.remove_queued(task_id).is_some() {
            self.cancel_queued(task_id).await;
            return true;
        }
        if let Some(running) = self.running.get(&task_id) {
            running.cancel.cancel();
            if let Some(record) = self.records.get_mut(&task_id) {
                record.cancel_requested = true;
            }
            debug!(%task_id, "Cancellation requested");
            return true;
        }
        false
    }

    /// Finish a task that never left the queue.
    async fn cancel_queued(&mut self, task_id: Uuid) {
        let Some(record) = self.records.get_mut(&task_id) else {
            return;
        };
        record.cancel_requested = true;
        if let Err(e) = record.transition_to(TaskStatus::Cancelled) {
            error!(%task_id, "{}", e);
            return;
        }
        self.publish(task_id);
        self.complete_record(task_id).await;
    }

    async fn stop(&mut self, running: bool, queued: bool) -> StopSummary {
        let mut summary = StopSummary::default();
        if queued {
            for task in self.queue.drain_queued() {
                self.cancel_queued(task.task_id).await;
                summary.queued += 1;
            }
        }
        if running {
            let ids: Vec<Uuid> = self.running.keys().copied().collect();
            for task_id in ids {
                if self.cancel(task_id).await {
                    summary.running += 1;
                }
            }
        }
        if summary != StopSummary::default() {
            self.journal(format!(
                "Stopped {} running and {} queued tasks",
                summary.running, summary.queued
            ))
            .await;
        }
        summary
    }

    async fn pause(&mut self, reason: PauseReason) {
        match self.pause_reason {
            // A user pause is never downgraded to one that lifts itself.
            Some(PauseReason::User) if reason == PauseReason::QuotaExceeded => return,
            Some(current) if current == reason => return,
            _ => {}
        }
        let was_paused = self.pause_reason.is_some();
        self.pause_reason = Some(reason);
        self.queue.pause();
        self.pause_tx.send_replace(Some(reason));

        if !was_paused && self.config.suspend_on_pause {
            let ids: Vec<Uuid> = self.running.keys().copied().collect();
            for task_id in ids {
                self.suspend(task_id);
                self.publish(task_id);
            }
        }

        let _ = self.events.send(TaskEvent::QueuePaused { reason });
        let message = match reason {
            PauseReason::User => "Queue paused",
            PauseReason::QuotaExceeded => "Queue paused: account balance exhausted",
        };
        info!("{}", message);
        self.journal(message.to_string()).await;
    }

    /// SIGSTOP a running process and mark it paused.
    fn suspend(&mut self, task_id: Uuid) {
        let control = self.running.get(&task_id).and_then(|r| r.control);
        let Some(record) = self.records.get_mut(&task_id) else {
            return;
        };
        let Some(control) = control else {
            return;
        };
        if record.status != TaskStatus::Running {
            return;
        }
        match control.suspend() {
            Ok(()) => {
                if let Err(e) = record.transition_to(TaskStatus::Paused) {
                    error!(%task_id, "{}", e);
                }
            }
            Err(e) => warn!(%task_id, "Failed to suspend process: {}", e),
        }
    }

    async fn resume(&mut self, only_if: Option<PauseReason>) -> bool {
        let Some(current) = self.pause_reason else {
            return false;
        };
        if only_if.is_some_and(|required| required != current) {
            return false;
        }
        self.pause_reason = None;
        self.queue.resume();
        self.pause_tx.send_replace(None);

        let ids: Vec<Uuid> = self.running.keys().copied().collect();
        for task_id in ids {
            let control = self.running.get(&task_id).and_then(|r| r.control);
            let Some(record) = self.records.get_mut(&task_id) else {
                continue;
            };
            if record.status != TaskStatus::Paused {
                continue;
            }
            if let Some(control) = control {
                if let Err(e) = control.resume() {
                    warn!(%task_id, "Failed to resume process: {}", e);
                }
            }
            if let Err(e) = record.transition_to(TaskStatus::Running) {
                error!(%task_id, "{}", e);
            }
            self.publish(task_id);
        }

        let _ = self.events.send(TaskEvent::QueueResumed);
        info!("Queue resumed");
        self.journal("Queue resumed".to_string()).await;
        true
    }

    async fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!(
            running = self.running.len(),
            "Shutting down task dispatcher"
        );
        self.shutting_down = true;
        self.stop(true, true).await;
    }

    fn publish(&self, task_id: Uuid) {
        if let Some(record) = self.records.get(&task_id) {
            let _ = self
                .events
                .send(TaskEvent::TaskStatusChanged(record.snapshot()));
        }
    }

    fn publish_counts(&self) {
        let queue = self.queue.counts();
        let counts = TaskCounts {
            queued: queue.queued,
            running: queue.running,
            paused: self.pause_reason.is_some(),
        };
        self.counts_tx.send_if_modified(|current| {
            if *current == counts {
                false
            } else {
                *current = counts;
                true
            }
        });
    }

    async fn journal(&self, message: String) {
        append_journal(&*self.store, &self.events, message).await;
    }
}
