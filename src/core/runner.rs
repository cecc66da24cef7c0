//! Subprocess control for the external sync/delete tools.
//!
//! The runner launches a tool, streams its merged stdout/stderr as lines over
//! an `mpsc` channel the moment each terminator (`\n` or rsync's `\r`) arrives,
//! and supports cooperative cancellation: SIGTERM first, SIGKILL once the grace
//! period runs out.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{JobError, Result};

/// rsync: "partial transfer due to vanished source files".
pub const RSYNC_VANISHED: i32 = 24;

/// Time between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8 * 1024;
const LINE_CHANNEL_CAPACITY: usize = 256;

/// A fully described tool launch.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Exit codes that count as success.
    pub accepted_codes: Vec<i32>,
}

impl Invocation {
    /// Live copy with machine-parseable overall progress and partial-transfer resume.
    pub fn rsync_copy(rsync: &Path, source: &Path, destination: &Path) -> Self {
        let mut args = rsync_base_args();
        args.extend(
            ["--info=progress2", "--no-inc-recursive", "--partial", "--append-verify"]
                .map(OsString::from),
        );
        args.push(source.as_os_str().to_owned());
        args.push(destination.as_os_str().to_owned());
        Self {
            program: rsync.to_path_buf(),
            args,
            accepted_codes: vec![0, RSYNC_VANISHED],
        }
    }

    /// Dry run listing one changed file name per line.
    pub fn rsync_dry_run(rsync: &Path, source: &Path, destination: &Path) -> Self {
        let mut args = rsync_base_args();
        args.extend(["--dry-run", "--itemize-changes", "--out-format=%n"].map(OsString::from));
        args.push(source.as_os_str().to_owned());
        args.push(destination.as_os_str().to_owned());
        Self {
            program: rsync.to_path_buf(),
            args,
            accepted_codes: vec![0, RSYNC_VANISHED],
        }
    }

    /// Recursive forced removal of a single path.
    pub fn remove_recursive(rm: &Path, target: &Path) -> Self {
        Self {
            program: rm.to_path_buf(),
            args: vec![
                OsString::from("-rf"),
                OsString::from("--"),
                target.as_os_str().to_owned(),
            ],
            accepted_codes: vec![0],
        }
    }

    /// Short tool name used in errors and logs.
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    /// Map a raw exit status to the accepted/failed policy.
    pub fn check_exit(&self, status: ExitStatus) -> Result<i32> {
        let code = exit_code(status);
        if self.accepted_codes.contains(&code) {
            if code != 0 {
                warn!(tool = %self.tool_name(), exit_code = code, "Tool reported partial success");
            }
            Ok(code)
        } else {
            Err(JobError::ToolFailed {
                tool: self.tool_name(),
                code,
            })
        }
    }
}

fn rsync_base_args() -> Vec<OsString> {
    ["-a", "--human-readable", "--protect-args"]
        .map(OsString::from)
        .to_vec()
}

/// Exit code, or 128 + signal number for signal-terminated processes.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Launches tools and owns the cancellation token for the current run.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace: Duration,
    cancel: CancellationToken,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

impl ProcessRunner {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            cancel: CancellationToken::new(),
        }
    }

    /// Request termination of any in-flight process. Later launches fail fast.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Start a tool and hand back a handle yielding its output lines lazily.
    pub fn spawn(&self, invocation: &Invocation) -> Result<ToolProcess> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let tool = invocation.tool_name();
        debug!(tool = %tool, args = ?invocation.args, "Spawning tool");

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| JobError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_lines(stderr, tx)));
        }

        Ok(ToolProcess {
            invocation: invocation.clone(),
            child,
            lines: rx,
            pumps,
            grace: self.grace,
            cancel: self.cancel.clone(),
        })
    }

    /// Run a tool to completion, forwarding every output line to `tx`.
    ///
    /// Returns the accepted exit code. A dropped receiver does not stop the
    /// tool; remaining output is drained and discarded.
    pub async fn run(&self, invocation: &Invocation, tx: mpsc::Sender<String>) -> Result<i32> {
        let mut process = self.spawn(invocation)?;
        let mut forwarding = true;
        while let Some(line) = process.next_line().await {
            if forwarding && tx.send(line).await.is_err() {
                forwarding = false;
            }
        }
        drop(tx);
        process.wait().await
    }
}

/// A running tool.
pub struct ToolProcess {
    invocation: Invocation,
    child: Child,
    lines: mpsc::Receiver<String>,
    pumps: Vec<JoinHandle<()>>,
    grace: Duration,
    cancel: CancellationToken,
}

impl ToolProcess {
    /// Next merged output line; `None` at end of output or on cancellation.
    pub async fn next_line(&mut self) -> Option<String> {
        tokio::select! {
            line = self.lines.recv() => line,
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Wait for exit and apply the exit-code policy.
    pub async fn wait(mut self) -> Result<i32> {
        let status = tokio::select! {
            status = self.child.wait() => status?,
            _ = self.cancel.cancelled() => {
                self.terminate().await;
                return Err(JobError::Cancelled);
            }
        };

        // Unblock pumps still holding unread lines, then let them finish.
        self.lines.close();
        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }

        debug!(tool = %self.invocation.tool_name(), status = %status, "Tool exited");
        self.invocation.check_exit(status)
    }

    async fn terminate(&mut self) {
        let tool = self.invocation.tool_name();
        if let Some(pid) = self.child.id() {
            info!(tool = %tool, pid, "Sending SIGTERM");
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(tool = %tool, error = %e, "SIGTERM failed");
            }
        }

        match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(_) => debug!(tool = %tool, "Tool exited after SIGTERM"),
            Err(_) => {
                warn!(
                    tool = %tool,
                    grace_ms = self.grace.as_millis() as u64,
                    "Tool ignored SIGTERM, killing"
                );
                if let Err(e) = self.child.start_kill() {
                    debug!(tool = %tool, error = %e, "SIGKILL failed");
                }
                let _ = self.child.wait().await;
            }
        }

        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

/// Split a byte stream on `\r`/`\n` and forward non-empty lines.
async fn pump_lines<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut line = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut open = true;

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        for &b in &chunk[..n] {
            if b == b'\r' || b == b'\n' {
                if line.is_empty() {
                    continue;
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                line.clear();
                if open && tx.send(text).await.is_err() {
                    open = false;
                }
            } else {
                line.push(b);
            }
        }
    }

    if open && !line.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&line).into_owned()).await;
    }
}
