//! End-to-end tests for the task manager.
//!
//! Each test writes a small shell script standing in for the backup tool,
//! points the configuration at it and drives the manager through its public
//! API, observing the event feed.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;
use uuid::Uuid;

use archivist::error::{Error, TaskError};
use archivist::store::LibSqlBackend;
use archivist::tasks::{
    ErrorClass, FailureReason, PauseReason, TaskEvent, TaskSnapshot, TaskStatus,
    TokioProcessRunner,
};
use archivist::{AppConfig, Job, JobKind, JobOptions, TaskManager};

/// Maximum time any wait is allowed before we consider the test hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Write an executable fake tool into `dir`.
fn fake_tool(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-tool");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(tool: PathBuf) -> AppConfig {
    AppConfig {
        tool_path: tool,
        max_concurrent_tasks: 1,
        max_attempts: 3,
        retry_backoff: Duration::from_millis(10),
        cancel_grace: Duration::from_millis(500),
        ..AppConfig::default()
    }
}

async fn start(config: AppConfig) -> Arc<TaskManager> {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let runner = Arc::new(TokioProcessRunner::new(config.cancel_grace));
    TaskManager::start(config, store, runner).unwrap()
}

async fn backup_job(manager: &TaskManager, name: &str, dir: &Path) -> Job {
    manager
        .add_job(Job::backup(name, [dir.to_path_buf()]))
        .await
        .unwrap()
}

/// Wait until `task_id` reaches `status` and return that snapshot.
async fn wait_for_status(
    events: &mut broadcast::Receiver<TaskEvent>,
    task_id: Uuid,
    status: TaskStatus,
) -> TaskSnapshot {
    timeout(TEST_TIMEOUT, async {
        loop {
            if let TaskEvent::TaskStatusChanged(snapshot) = events.recv().await.unwrap() {
                if snapshot.id == task_id && snapshot.status == status {
                    return snapshot;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {task_id} never reached {status}"))
}

/// Wait for the first terminal status of `task_id`.
async fn wait_for_terminal(
    events: &mut broadcast::Receiver<TaskEvent>,
    task_id: Uuid,
) -> TaskSnapshot {
    timeout(TEST_TIMEOUT, async {
        loop {
            if let TaskEvent::TaskStatusChanged(snapshot) = events.recv().await.unwrap() {
                if snapshot.id == task_id && snapshot.status.is_terminal() {
                    return snapshot;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {task_id} never finished"))
}

/// Wait for the fake tool to record its pid.
async fn read_pid(pidfile: &Path) -> i32 {
    timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(text) = std::fs::read_to_string(pidfile) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap()
}

/// Scheduler state of `pid` from procfs. `None` off Linux.
fn process_state(pid: i32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces; the state follows its closing paren.
    stat.rsplit_once(") ")?.1.chars().next()
}

/// Wait until `pid` is (or is not) stopped, where procfs is available.
async fn wait_for_stopped(pid: i32, stopped: bool) {
    if process_state(pid).is_none() {
        return;
    }
    timeout(TEST_TIMEOUT, async {
        while process_state(pid).map(|state| state == 'T') != Some(stopped) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("process {pid} never reached stopped={stopped}"));
}

async fn next_archive_list(events: &mut broadcast::Receiver<TaskEvent>) -> Vec<String> {
    timeout(TEST_TIMEOUT, async {
        loop {
            if let TaskEvent::ArchiveListUpdated { archives } = events.recv().await.unwrap() {
                return archives.into_iter().map(|a| a.name).collect();
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn successful_backup_completes_and_is_recorded() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(dir.path(), "echo 'Processed 3 files, 1.5 MB'\nexit 0");
    let manager = start(config(tool)).await;
    let mut events = manager.subscribe();

    let job = backup_job(&manager, "docs", dir.path()).await;
    let handle = manager.backup_now(job.id).await.unwrap();
    assert_eq!(handle.job_id, Some(job.id));

    let done = wait_for_terminal(&mut events, handle.task_id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.attempt, 1);
    assert!(done.output.contains("Processed 3 files"));

    // Answered by the dispatcher only after the run has been persisted.
    manager.get_status(handle.task_id).await.unwrap();
    let history = manager.task_history(Some(job.id), 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, handle.task_id);

    let job = manager.job(job.id).await.unwrap();
    assert!(job.last_run_at.is_some());
    manager.shutdown().await;
}

#[tokio::test]
async fn duplicate_submit_is_rejected() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(dir.path(), "exit 0");
    let manager = start(config(tool)).await;
    manager.pause_all(PauseReason::User).await.unwrap();

    let job = backup_job(&manager, "docs", dir.path()).await;
    manager.backup_now(job.id).await.unwrap();
    let second = manager.backup_now(job.id).await;
    match second {
        Err(Error::Task(TaskError::DuplicateActiveJob { job_id })) => {
            assert_eq!(job_id, job.id);
        }
        other => panic!("expected a duplicate rejection, got {other:?}"),
    }
    assert_eq!(manager.task_counts().queued, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn concurrent_submits_admit_exactly_one() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(dir.path(), "exit 0");
    let manager = start(config(tool)).await;
    manager.pause_all(PauseReason::User).await.unwrap();
    let job = backup_job(&manager, "docs", dir.path()).await;

    let mut joins = Vec::new();
    for _ in 0..16 {
        let manager = Arc::clone(&manager);
        joins.push(tokio::spawn(async move {
            manager.submit(job.id, JobKind::Backup, JobOptions::new()).await
        }));
    }

    let mut admitted = 0;
    for join in joins {
        match join.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(Error::Task(TaskError::DuplicateActiveJob { .. })) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn fatal_marker_overrides_zero_exit() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(
        dir.path(),
        "echo 'tarsnap: Sequence number mismatch: Run --fsck' >&2\nexit 0",
    );
    let manager = start(config(tool)).await;
    let mut events = manager.subscribe();

    let job = backup_job(&manager, "docs", dir.path()).await;
    let handle = manager.backup_now(job.id).await.unwrap();
    let done = wait_for_terminal(&mut events, handle.task_id).await;

    assert_eq!(done.status, TaskStatus::Failed);
    match done.reason {
        Some(FailureReason::ToolReported { class, .. }) => {
            assert_eq!(class, Some(ErrorClass::CacheOutOfSync));
        }
        other => panic!("unexpected reason {other:?}"),
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn transient_errors_are_retried_until_the_limit() {
    let dir = TempDir::new().unwrap();
    let counter = dir.path().join("attempts");
    let tool = fake_tool(
        dir.path(),
        &format!(
            "echo x >> '{}'\necho 'tarsnap: Connection lost, waiting 5 seconds' >&2\nexit 1",
            counter.display()
        ),
    );
    let manager = start(config(tool)).await;
    let mut events = manager.subscribe();

    let job = backup_job(&manager, "docs", dir.path()).await;
    let handle = manager.backup_now(job.id).await.unwrap();
    let done = wait_for_terminal(&mut events, handle.task_id).await;

    assert_eq!(done.status, TaskStatus::Failed);
    match done.reason {
        Some(FailureReason::Transient { class, attempts, .. }) => {
            assert_eq!(class, ErrorClass::Network);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected reason {other:?}"),
    }
    let runs = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(runs.lines().count(), 3);
    manager.shutdown().await;
}

#[tokio::test]
async fn missing_tool_fails_without_retry() {
    let dir = TempDir::new().unwrap();
    let manager = start(config(dir.path().join("does-not-exist"))).await;
    let mut events = manager.subscribe();

    let handle = manager.tool_version().await.unwrap();
    let done = wait_for_terminal(&mut events, handle.task_id).await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.attempt, 1);
    assert!(matches!(done.reason, Some(FailureReason::Spawn { .. })));
    manager.shutdown().await;
}

#[tokio::test]
async fn cancel_kills_the_running_process() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("pid");
    let tool = fake_tool(
        dir.path(),
        &format!("echo $$ > '{}'\nexec sleep 30", pidfile.display()),
    );
    let manager = start(config(tool)).await;
    let mut events = manager.subscribe();

    let job = backup_job(&manager, "docs", dir.path()).await;
    let handle = manager.backup_now(job.id).await.unwrap();
    wait_for_status(&mut events, handle.task_id, TaskStatus::Running).await;

    let pid = read_pid(&pidfile).await;

    assert!(manager.cancel(handle.task_id).await.unwrap());
    let done = wait_for_terminal(&mut events, handle.task_id).await;
    assert_eq!(done.status, TaskStatus::Cancelled);

    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None);
    assert!(alive.is_err(), "process {pid} survived cancellation");

    // Cancelling a terminal task is a no-op.
    assert!(!manager.cancel(handle.task_id).await.unwrap());
    manager.shutdown().await;
}

#[tokio::test]
async fn maintenance_runs_before_queued_backups() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(dir.path(), "exit 0");
    let manager = start(config(tool)).await;
    let mut events = manager.subscribe();

    manager.pause_all(PauseReason::User).await.unwrap();
    let first = backup_job(&manager, "first", dir.path()).await;
    let second = backup_job(&manager, "second", dir.path()).await;
    let backup_a = manager.backup_now(first.id).await.unwrap();
    let backup_b = manager.backup_now(second.id).await.unwrap();
    let repair = manager.repair_cache(false).await.unwrap();
    assert!(manager.resume_all().await.unwrap());

    let wanted = [backup_a.task_id, backup_b.task_id, repair.task_id];
    let started: Vec<Uuid> = timeout(TEST_TIMEOUT, async {
        let mut order = Vec::new();
        while order.len() < wanted.len() {
            if let TaskEvent::TaskStatusChanged(snapshot) = events.recv().await.unwrap() {
                if snapshot.status == TaskStatus::Started && wanted.contains(&snapshot.id) {
                    order.push(snapshot.id);
                }
            }
        }
        order
    })
    .await
    .unwrap();

    assert_eq!(started, [repair.task_id, backup_a.task_id, backup_b.task_id]);
    manager.shutdown().await;
}

#[tokio::test]
async fn archive_listing_updates_the_cache() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(
        dir.path(),
        "printf 'docs-20240301\\t2024-03-01 10:00:00\\ttarsnap -c -f docs-20240301 /data\\n'\n\
         printf 'docs-20240302\\t2024-03-02 10:00:00\\ttarsnap -c -f docs-20240302 /data\\n'\n\
         exit 0",
    );
    let manager = start(config(tool)).await;
    let mut events = manager.subscribe();

    let handle = manager.load_archives().await.unwrap();
    let listed = timeout(TEST_TIMEOUT, async {
        loop {
            if let TaskEvent::ArchiveListUpdated { archives } = events.recv().await.unwrap() {
                return archives;
            }
        }
    })
    .await
    .unwrap();

    let names: Vec<&str> = listed.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, ["docs-20240301", "docs-20240302"]);
    assert!(manager.archive("docs-20240302").await.is_some());
    assert_eq!(manager.get_status(handle.task_id).await.unwrap().status, TaskStatus::Completed);
    manager.shutdown().await;
}

#[tokio::test]
async fn deleting_a_job_with_an_active_task_is_refused() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(dir.path(), "exit 0");
    let manager = start(config(tool)).await;
    manager.pause_all(PauseReason::User).await.unwrap();

    let job = backup_job(&manager, "docs", dir.path()).await;
    let handle = manager.backup_now(job.id).await.unwrap();
    assert!(matches!(
        manager.delete_job(job.id, false).await,
        Err(Error::Task(TaskError::InvalidRequest(_)))
    ));

    let summary = manager.stop_tasks(false, true).await.unwrap();
    assert_eq!(summary.queued, 1);
    assert_eq!(
        manager.get_status(handle.task_id).await.unwrap().status,
        TaskStatus::Cancelled
    );
    assert!(manager.delete_job(job.id, false).await.unwrap().is_none());
    assert!(manager.jobs().await.unwrap().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn stderr_warnings_are_not_listed_as_archives() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(
        dir.path(),
        "echo 'tarsnap: Removing leading / from member names' >&2\n\
         printf 'real\\t2024-03-01 10:00:00\\n'\n\
         echo 'Warning: cache is old' >&2\n\
         exit 0",
    );
    let manager = start(config(tool)).await;
    let mut events = manager.subscribe();

    let handle = manager.load_archives().await.unwrap();
    assert_eq!(next_archive_list(&mut events).await, ["real"]);
    let done = manager.get_status(handle.task_id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.output.contains("Warning: cache is old"));
    manager.shutdown().await;
}

#[tokio::test]
async fn suspended_task_resumes_and_can_be_cancelled() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("pid");
    let tool = fake_tool(
        dir.path(),
        &format!("echo $$ > '{}'\nexec sleep 30", pidfile.display()),
    );
    let manager = start(AppConfig {
        suspend_on_pause: true,
        ..config(tool)
    })
    .await;
    let mut events = manager.subscribe();

    let job = backup_job(&manager, "docs", dir.path()).await;
    let handle = manager.backup_now(job.id).await.unwrap();
    wait_for_status(&mut events, handle.task_id, TaskStatus::Running).await;
    let pid = read_pid(&pidfile).await;

    manager.pause_all(PauseReason::User).await.unwrap();
    wait_for_status(&mut events, handle.task_id, TaskStatus::Paused).await;
    wait_for_stopped(pid, true).await;

    assert!(manager.resume_all().await.unwrap());
    wait_for_status(&mut events, handle.task_id, TaskStatus::Running).await;
    wait_for_stopped(pid, false).await;

    manager.pause_all(PauseReason::User).await.unwrap();
    wait_for_status(&mut events, handle.task_id, TaskStatus::Paused).await;

    // A stopped process must still die on cancel.
    assert!(manager.cancel(handle.task_id).await.unwrap());
    let done = wait_for_terminal(&mut events, handle.task_id).await;
    assert_eq!(done.status, TaskStatus::Cancelled);
    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None);
    assert!(alive.is_err(), "suspended process {pid} survived cancellation");
    manager.shutdown().await;
}

#[tokio::test]
async fn quota_marker_fails_the_task_and_pauses_the_queue() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(
        dir.path(),
        "echo 'tarsnap: Account balance is not positive' >&2\nexit 1",
    );
    let manager = start(config(tool)).await;
    let mut events = manager.subscribe();

    let job = backup_job(&manager, "docs", dir.path()).await;
    let handle = manager.backup_now(job.id).await.unwrap();
    let done = wait_for_terminal(&mut events, handle.task_id).await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.attempt, 1);
    assert!(matches!(
        done.reason,
        Some(FailureReason::ToolReported {
            class: Some(ErrorClass::QuotaExceeded),
            ..
        })
    ));
    assert_eq!(manager.pause_reason(), Some(PauseReason::QuotaExceeded));
    assert!(manager.task_counts().paused);
    manager.shutdown().await;
}

#[tokio::test]
async fn raising_the_concurrency_limit_starts_queued_work() {
    let dir = TempDir::new().unwrap();
    let tool = fake_tool(dir.path(), "exec sleep 30");
    let base = config(tool);
    let manager = start(base.clone()).await;
    let mut events = manager.subscribe();

    let first = backup_job(&manager, "docs", dir.path()).await;
    let second = backup_job(&manager, "mail", dir.path()).await;
    let first = manager.backup_now(first.id).await.unwrap();
    let second = manager.backup_now(second.id).await.unwrap();
    wait_for_status(&mut events, first.task_id, TaskStatus::Running).await;
    assert_eq!(manager.task_counts().queued, 1);

    manager
        .reload_config(AppConfig {
            max_concurrent_tasks: 2,
            ..base
        })
        .await
        .unwrap();
    wait_for_status(&mut events, second.task_id, TaskStatus::Running).await;
    let counts = manager.task_counts();
    assert_eq!((counts.running, counts.queued), (2, 0));

    let stopped = manager.stop_tasks(true, true).await.unwrap();
    assert_eq!(stopped.running, 2);
    for task_id in [first.task_id, second.task_id] {
        let done = wait_for_terminal(&mut events, task_id).await;
        assert_eq!(done.status, TaskStatus::Cancelled);
    }
    manager.shutdown().await;
}

#[tokio::test]
async fn deleting_a_job_purges_only_its_own_archives() {
    let dir = TempDir::new().unwrap();
    let calls = dir.path().join("calls");
    let tool = fake_tool(
        dir.path(),
        &format!(
            "echo \"$*\" >> '{}'\n\
             if [ \"$1\" = --list-archives ]; then\n\
             printf 'Job_web_2024-03-09_14-05-07\\t2024-03-09 14:05:07\\n'\n\
             printf 'Job_web_prod_2024-03-09_14-05-07\\t2024-03-09 14:05:07\\n'\n\
             printf 'other\\t2024-03-09 14:05:07\\n'\n\
             fi\n\
             exit 0",
            calls.display()
        ),
    );
    let manager = start(config(tool)).await;
    let mut events = manager.subscribe();

    let web = backup_job(&manager, "web", dir.path()).await;
    backup_job(&manager, "web_prod", dir.path()).await;
    manager.load_archives().await.unwrap();
    assert_eq!(next_archive_list(&mut events).await.len(), 3);

    let handle = manager
        .delete_job(web.id, true)
        .await
        .unwrap()
        .expect("owned archives are deleted");
    let done = wait_for_terminal(&mut events, handle.task_id).await;
    assert_eq!(done.status, TaskStatus::Completed);

    let log = std::fs::read_to_string(&calls).unwrap();
    let delete = log
        .lines()
        .find(|line| line.starts_with("-d "))
        .expect("delete was invoked");
    assert_eq!(delete, "-d -f Job_web_2024-03-09_14-05-07");

    assert_eq!(
        next_archive_list(&mut events).await,
        ["Job_web_prod_2024-03-09_14-05-07", "other"]
    );
    assert_eq!(manager.jobs().await.unwrap().len(), 1);
    manager.shutdown().await;
}
