//! NR-010: Runner abstraction, the only I/O boundary of the engine.
//!
//! Local execution goes through `bash -c`, remote execution through the
//! system `ssh` binary. Both kill the child process when the context is
//! cancelled or times out.

pub mod context;
#[cfg(test)]
pub(crate) mod fake;
pub mod local;
pub mod ssh;

pub use context::{CancelHandle, Context};

use crate::core::types::Machine;
use crate::error::RunError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Bytes fed to the command's stdin.
    pub stdin: Option<String>,
}

impl RunOptions {
    pub fn with_stdin(input: impl Into<String>) -> Self {
        Self {
            stdin: Some(input.into()),
        }
    }
}

/// Executes command strings on exactly one target host.
///
/// Implementations must return the combined output inside
/// [`RunError::Exit`] when the command fails, since "not installed"
/// detection matches on that output.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, ctx: &Context, command: &str, opts: &RunOptions)
        -> Result<String, RunError>;

    /// Human-readable target, for logs.
    fn target(&self) -> &str;
}

/// Output from executing a command on a target.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }

    pub fn into_result(self) -> Result<String, RunError> {
        if self.success() {
            Ok(self.combined())
        } else {
            Err(RunError::Exit {
                exit_code: self.exit_code,
                output: self.combined(),
            })
        }
    }
}

/// Spawn `cmd`, feed stdin, and wait for it unless the context finishes first.
/// Feeding and waiting both sit under the context, so a child that never
/// drains its stdin cannot block cancellation. The child is killed when the
/// wait is abandoned.
pub(crate) async fn exec(
    mut cmd: Command,
    ctx: &Context,
    opts: &RunOptions,
    what: &str,
) -> Result<ExecOutput, RunError> {
    if let Some(reason) = ctx.err() {
        return Err(reason);
    }

    cmd.stdin(if opts.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| RunError::Transport(format!("failed to spawn {}: {}", what, e)))?;

    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(mut pipe), Some(input)) = (pipe, opts.stdin.as_deref()) {
            pipe.write_all(input.as_bytes()).await?;
        }
        Ok::<(), std::io::Error>(())
    };

    let (fed, output) = tokio::select! {
        both = async { tokio::join!(feed, child.wait_with_output()) } => both,
        reason = ctx.done() => return Err(reason),
    };
    let output =
        output.map_err(|e| RunError::Transport(format!("{} wait error: {}", what, e)))?;
    // A child may exit without reading all of its input; its exit status decides.
    if let Err(e) = fed {
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            return Err(RunError::Transport(format!("stdin write error: {}", e)));
        }
    }

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Open a runner for a machine: local for loopback addresses, SSH otherwise.
pub fn connect(machine: &Machine) -> Box<dyn Runner> {
    if is_local_addr(&machine.addr) {
        Box::new(local::LocalRunner::new())
    } else {
        Box::new(ssh::SshRunner::new(machine))
    }
}

/// Probe the host until it answers, with a bounded number of attempts.
/// Each failed attempt is logged.
pub async fn wait_reachable(
    runner: &dyn Runner,
    ctx: &Context,
    attempts: u32,
    delay: Duration,
) -> Result<(), RunError> {
    let attempts = attempts.max(1);
    let mut last = RunError::Transport("no attempt made".to_string());
    for attempt in 1..=attempts {
        match runner.run(ctx, "true", &RunOptions::default()).await {
            Ok(_) => {
                debug!(target_host = runner.target(), attempt, "host reachable");
                return Ok(());
            }
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                warn!(
                    target_host = runner.target(),
                    attempt,
                    attempts,
                    error = %e,
                    "host not reachable"
                );
                last = e;
            }
        }
        if attempt < attempts {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                reason = ctx.done() => return Err(reason),
            }
        }
    }
    Err(last)
}

/// Single-quote a string for POSIX shells.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Quote only when the word contains characters the shell would interpret.
pub fn shell_arg(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "._+-:=/@,^%".contains(c));
    if plain {
        s.to_string()
    } else {
        shell_quote(s)
    }
}

/// Check if an address is this machine.
fn is_local_addr(addr: &str) -> bool {
    if addr == "127.0.0.1" || addr == "localhost" || addr == "::1" {
        return true;
    }
    if let Ok(hostname) = std::fs::read_to_string("/etc/hostname") {
        if addr == hostname.trim() {
            return true;
        }
    }
    false
}
