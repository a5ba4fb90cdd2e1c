//! Podwatch process lifetime.
//!
//! Two halves: inside the watcher process, signal handlers that turn
//! termination requests into an immediate clean exit; outside, an escalating
//! terminate/kill procedure that bounds shutdown latency even when the
//! watcher is stuck in a network read.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{info, warn};

/// Called once at watcher process start, before any watch call: drops
/// credential and filesystem state inherited from the owning controller so
/// the watcher re-infers its own (e.g. in-cluster) configuration.
pub fn invalidate_inherited_caches() {
    if std::env::var_os("KUBECONFIG").is_some() {
        std::env::remove_var("KUBECONFIG");
        info!("dropped inherited KUBECONFIG; watch client re-infers its config");
    }
    podwatch_stream::reset_client_cache();
}

/// Route SIGINT, SIGTERM and SIGQUIT to an immediate clean exit (code 0).
///
/// The exit is deliberate and non-retryable: a termination request must not
/// surface as an error through the per-event handling path. Must be called
/// from within a tokio runtime.
pub fn install_signal_exit() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("installing SIGQUIT handler")?;
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = sigquit.recv() => "SIGQUIT",
        };
        info!(signal = name, pid = std::process::id(), "watcher received termination signal; exiting");
        std::process::exit(0);
    });
    Ok(())
}

/// Rounds of SIGTERM before escalating to SIGKILL.
const TERMINATE_ATTEMPTS: u32 = 10;
/// Wait for exit after each SIGTERM.
const TERMINATE_WAIT: Duration = Duration::from_secs(10);
/// Grace period after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Minimal process-control surface so the escalation policy is testable
/// without spawning real processes.
#[async_trait]
pub trait ProcessHandle: Send {
    fn id(&self) -> Option<u32>;
    /// Ask the process to exit (SIGTERM).
    fn terminate(&mut self) -> Result<()>;
    /// Force the process down (SIGKILL).
    fn kill(&mut self) -> Result<()>;
    /// Wait up to `timeout` for exit; true when the process is gone.
    async fn wait_exited(&mut self, timeout: Duration) -> Result<bool>;
}

/// Guarantee eventual death of the watcher process.
///
/// A plain SIGTERM can be swallowed while the watcher is blocked inside a
/// network read, so termination is retried with a bounded wait and finally
/// escalated to SIGKILL. This is the only sanctioned forced kill in the
/// subsystem.
pub async fn safe_terminate(proc_: &mut dyn ProcessHandle) -> Result<()> {
    let Some(pid) = proc_.id() else {
        return Ok(()); // already reaped
    };
    info!(pid, "terminating watcher process");
    for attempt in 1..=TERMINATE_ATTEMPTS {
        proc_.terminate()?;
        if proc_.wait_exited(TERMINATE_WAIT).await? {
            info!(pid, attempt, "watcher terminated");
            return Ok(());
        }
        info!(pid, attempt, "watcher still running after SIGTERM");
    }
    warn!(pid, "watcher unresponsive to SIGTERM; sending SIGKILL");
    proc_.kill()?;
    proc_.wait_exited(KILL_GRACE).await?;
    Ok(())
}

/// A spawned watcher child process with its transition stream on stdout.
pub struct WatcherChild {
    child: Child,
}

impl WatcherChild {
    /// Spawn the watcher command with piped stdout; returns the handle and
    /// the stdout end carrying JSON-line transitions.
    pub fn spawn(mut cmd: Command) -> Result<(Self, ChildStdout)> {
        cmd.stdout(Stdio::piped());
        let mut child = cmd.spawn().context("spawning watcher process")?;
        let stdout = child
            .stdout
            .take()
            .context("watcher stdout not captured")?;
        Ok((Self { child }, stdout))
    }

    pub async fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child.wait().await.context("waiting for watcher exit")
    }
}

#[async_trait]
impl ProcessHandle for WatcherChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn terminate(&mut self) -> Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(()); // exited between checks
        };
        // SAFETY: plain kill(2) on a child pid this handle owns.
        let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // ESRCH means the process died before the signal landed.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err).context("sending SIGTERM to watcher");
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // InvalidInput: the child was already reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e).context("sending SIGKILL to watcher"),
        }
    }

    async fn wait_exited(&mut self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                status.context("waiting for watcher exit")?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}
