// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker subprocess spawning with a process-group timeout kill.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Grace between SIGTERM and SIGKILL on timeout.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Environment variable carrying the session id into the worker.
pub const SESSION_ENV_VAR: &str = "AGENT_FIREWALL_SESSION_ID";

/// Result of one worker invocation.
#[derive(Debug)]
pub struct WorkerOutcome {
    /// Exit code; `None` when the process died from a signal.
    pub exit_code: Option<i32>,
    /// Whether the wall-clock timeout fired.
    pub timed_out: bool,
    /// Captured stdout bytes.
    pub stdout: Vec<u8>,
    /// Captured stderr bytes.
    pub stderr: Vec<u8>,
}

impl WorkerOutcome {
    /// `true` iff the worker exited 0 within the timeout.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Spawn `program` with `args` (no shell involved) and wait for it under
/// `timeout`.
///
/// The child gets the workspace as cwd, the parent environment plus the
/// session-id variable, and its own process group so a timeout signal
/// reaches grandchildren. On timeout the whole group receives SIGTERM,
/// then SIGKILL after a short grace.
pub async fn run_worker(
    program: &str,
    args: &[String],
    workspace: &Path,
    session_id: &str,
    timeout: Duration,
) -> io::Result<WorkerOutcome> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workspace)
        .env(SESSION_ENV_VAR, session_id)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            warn!(?pid, "worker timed out, signalling process group");
            terminate_group(&mut child, pid).await;
            (None, true)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(WorkerOutcome {
        exit_code,
        timed_out,
        stdout,
        stderr,
    })
}

/// SIGTERM the child's process group; escalate to SIGKILL after the grace
/// period; always reap the direct child.
async fn terminate_group(child: &mut Child, pid: Option<u32>) {
    signal_group(pid, false);
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
        return;
    }
    signal_group(pid, true);
    let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
    // Last resort for the direct child if the group signal failed.
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Signal the process group of `pid` via kill(1), targeting the negative
/// pid so grandchildren in the same group receive it too.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, force: bool) {
    let Some(pid) = pid else { return };
    let signal = if force { "KILL" } else { "TERM" };
    match std::process::Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .output()
    {
        Ok(out) if out.status.success() => {}
        Ok(out) => {
            debug!(pid, signal, code = ?out.status.code(), "group signal not delivered");
        }
        Err(err) => {
            debug!(pid, signal, error = %err, "failed to run kill");
        }
    }
}

/// Without process groups, only the direct child can be reached; grandchild
/// processes may survive the timeout.
#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _force: bool) {}
