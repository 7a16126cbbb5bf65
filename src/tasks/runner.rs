//! Process execution.
//!
//! A [`ProcessRunner`] starts the tool in its own process group and hands back
//! a [`ProcessHandle`] with line streams for stdout and stderr, a control
//! handle for suspend/resume, and the eventual exit. Cancelling the token
//! passed to [`ProcessRunner::run`] (or dropping the handle) terminates the
//! whole group: SIGTERM, a grace period, then SIGKILL.

use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::error::SpawnError;
use crate::tasks::command::CommandSpec;

/// Lines buffered per stream before the reader waits for the consumer.
const LINE_CHANNEL_CAPACITY: usize = 256;

pub type LineStream = ReceiverStream<String>;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited on its own. `signal` is set when it was killed by one.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Terminated because cancellation was requested.
    Cancelled,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0), .. })
    }
}

/// Suspend/resume access to a running process group.
#[derive(Debug, Clone, Copy)]
pub struct ProcessControl {
    pid: Option<u32>,
}

impl ProcessControl {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[cfg(unix)]
    pub fn suspend(&self) -> std::io::Result<()> {
        self.signal(nix::sys::signal::Signal::SIGSTOP)
    }

    #[cfg(unix)]
    pub fn resume(&self) -> std::io::Result<()> {
        self.signal(nix::sys::signal::Signal::SIGCONT)
    }

    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) -> std::io::Result<()> {
        match self.pid {
            Some(pid) => signal_group(pid, signal).map_err(std::io::Error::from),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "process has no pid",
            )),
        }
    }

    #[cfg(not(unix))]
    pub fn suspend(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "suspend is not supported on this platform",
        ))
    }

    #[cfg(not(unix))]
    pub fn resume(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "resume is not supported on this platform",
        ))
    }
}

/// A running process.
pub struct ProcessHandle {
    control: ProcessControl,
    stdout: Option<LineStream>,
    stderr: Option<LineStream>,
    exit: oneshot::Receiver<ProcessExit>,
    _guard: DropGuard,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.control.pid
    }

    pub fn control(&self) -> ProcessControl {
        self.control
    }

    pub fn take_stdout(&mut self) -> Option<LineStream> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<LineStream> {
        self.stderr.take()
    }

    /// Both streams interleaved in arrival order. Ends when both pipes close.
    pub fn take_merged(&mut self) -> Pin<Box<dyn Stream<Item = OutputLine> + Send>> {
        let stdout = self
            .stdout
            .take()
            .map(|s| {
                s.map(|text| OutputLine {
                    stream: StreamKind::Stdout,
                    text,
                })
            });
        let stderr = self
            .stderr
            .take()
            .map(|s| {
                s.map(|text| OutputLine {
                    stream: StreamKind::Stderr,
                    text,
                })
            });
        match (stdout, stderr) {
            (Some(out), Some(err)) => Box::pin(out.merge(err)),
            (Some(out), None) => Box::pin(out),
            (None, Some(err)) => Box::pin(err),
            (None, None) => Box::pin(tokio_stream::empty::<OutputLine>()),
        }
    }

    /// Wait for the process to end.
    pub async fn wait(self) -> ProcessExit {
        let ProcessHandle { exit, _guard, .. } = self;
        let result = exit.await;
        // Keep the guard alive until the waiter reports, then let it go.
        drop(_guard);
        result.unwrap_or(ProcessExit::Exited {
            code: None,
            signal: None,
        })
    }
}

/// Starts external processes.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: CancellationToken,
    ) -> Result<ProcessHandle, SpawnError>;
}

/// Runs commands with `tokio::process`.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    grace: Duration,
}

impl TokioProcessRunner {
    /// `grace` is how long a cancelled process gets between SIGTERM and SIGKILL.
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: CancellationToken,
    ) -> Result<ProcessHandle, SpawnError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| SpawnError::from_io(&spec.program, e))?;
        let pid = child.id();
        debug!(program = %spec.program, ?pid, "Spawned process");

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    warn!("Failed to write process stdin: {}", e);
                }
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = child.stdout.take().map(spawn_line_reader);
        let stderr = child.stderr.take().map(spawn_line_reader);

        let token = cancel.child_token();
        let guard = token.clone().drop_guard();
        let (exit_tx, exit_rx) = oneshot::channel();
        let grace = self.grace;
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => exit_from_status(status),
                _ = token.cancelled() => {
                    terminate(&mut child, pid, grace).await;
                    ProcessExit::Cancelled
                }
            };
            let _ = exit_tx.send(exit);
        });

        Ok(ProcessHandle {
            control: ProcessControl { pid },
            stdout,
            stderr,
            exit: exit_rx,
            _guard: guard,
        })
    }
}

/// Read `reader` line by line into a channel. Invalid UTF-8 is replaced.
fn spawn_line_reader<R>(reader: R) -> LineStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    // Keep draining after the consumer goes away so the child
                    // never blocks on a full pipe.
                    let _ = tx.send(line).await;
                }
                Err(e) => {
                    debug!("Output reader stopped: {}", e);
                    break;
                }
            }
        }
    });
    ReceiverStream::new(rx)
}

fn exit_from_status(status: std::io::Result<std::process::ExitStatus>) -> ProcessExit {
    match status {
        Ok(status) => {
            #[cfg(unix)]
            let signal = std::os::unix::process::ExitStatusExt::signal(&status);
            #[cfg(not(unix))]
            let signal = None;
            ProcessExit::Exited {
                code: status.code(),
                signal,
            }
        }
        Err(e) => {
            warn!("Failed to wait for process: {}", e);
            ProcessExit::Exited {
                code: None,
                signal: None,
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> nix::Result<()> {
    let pgid = nix::unistd::Pid::from_raw(pid as i32);
    nix::sys::signal::killpg(pgid, signal)
}

/// SIGTERM the group, wait `grace`, then SIGKILL whatever is left.
#[cfg(unix)]
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    use nix::sys::signal::Signal;

    let Some(pid) = pid else {
        let _ = child.kill().await;
        return;
    };

    if let Err(e) = signal_group(pid, Signal::SIGTERM) {
        debug!(pid, "SIGTERM to process group failed: {}", e);
    }
    // A suspended group cannot act on SIGTERM.
    let _ = signal_group(pid, Signal::SIGCONT);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(pid, "Process exited after SIGTERM"),
        Err(_) => {
            warn!(pid, ?grace, "Process ignored SIGTERM, killing");
            let _ = signal_group(pid, Signal::SIGKILL);
            let _ = child.kill().await;
        }
    }
    // Children that outlived the leader.
    let _ = signal_group(pid, Signal::SIGKILL);
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _pid: Option<u32>, _grace: Duration) {
    let _ = child.kill().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            stdin: None,
            working_dir: None,
        }
    }

    async fn collect(handle: &mut ProcessHandle) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        let mut merged = handle.take_merged();
        while let Some(line) = merged.next().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let runner = TokioProcessRunner::new(Duration::from_secs(1));
        let mut handle = runner
            .run(&sh("echo out; echo err >&2; exit 3"), CancellationToken::new())
            .await
            .unwrap();
        let lines = collect(&mut handle).await;
        assert!(lines.contains(&OutputLine {
            stream: StreamKind::Stdout,
            text: "out".into()
        }));
        assert!(lines.contains(&OutputLine {
            stream: StreamKind::Stderr,
            text: "err".into()
        }));
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(
            exit,
            ProcessExit::Exited {
                code: Some(3),
                signal: None
            }
        );
    }

    #[tokio::test]
    async fn stdin_is_delivered() {
        let runner = TokioProcessRunner::new(Duration::from_secs(1));
        let mut spec = sh("read answer; echo \"got $answer\"");
        spec.stdin = Some("No Tomorrow\n".into());
        let mut handle = runner.run(&spec, CancellationToken::new()).await.unwrap();
        let lines = collect(&mut handle).await;
        assert_eq!(lines[0].text, "got No Tomorrow");
        assert!(handle.wait().await.success());
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let runner = TokioProcessRunner::new(Duration::from_secs(1));
        let mut handle = runner
            .run(&sh("printf 'a\\377b\\n'"), CancellationToken::new())
            .await
            .unwrap();
        let lines = collect(&mut handle).await;
        assert_eq!(lines[0].text, "a\u{FFFD}b");
    }

    #[tokio::test]
    async fn cancel_kills_process_group() {
        let runner = TokioProcessRunner::new(Duration::from_millis(200));
        let cancel = CancellationToken::new();
        let handle = runner
            .run(&sh("trap '' TERM; exec sleep 30"), cancel.clone())
            .await
            .unwrap();
        let pid = handle.pid().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(exit, ProcessExit::Cancelled);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let group = nix::unistd::Pid::from_raw(pid as i32);
        assert!(nix::sys::signal::killpg(group, None).is_err());
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let runner = TokioProcessRunner::new(Duration::from_secs(1));
        let spec = CommandSpec {
            program: "/nonexistent/tarsnap".into(),
            args: vec![],
            stdin: None,
            working_dir: None,
        };
        let err = runner.run(&spec, CancellationToken::new()).await.err().unwrap();
        assert!(matches!(err, SpawnError::NotFound { .. }));
    }
}
