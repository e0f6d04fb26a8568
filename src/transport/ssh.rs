//! NR-013: SSH execution runner.
//!
//! Uses the `ssh` binary directly, without libssh2. The command is
//! passed to a remote `bash -c` as one quoted argument; stdin is forwarded.

use super::{exec, shell_quote, Context, RunOptions, Runner};
use crate::core::types::Machine;
use crate::error::RunError;
use async_trait::async_trait;
use tokio::process::Command;

/// Runs commands on a remote machine over SSH.
#[derive(Debug, Clone)]
pub struct SshRunner {
    destination: String,
    port: Option<u16>,
    key: Option<String>,
}

impl SshRunner {
    pub fn new(machine: &Machine) -> Self {
        Self {
            destination: format!("{}@{}", machine.user, machine.addr),
            port: machine.port,
            key: machine.ssh_key.as_deref().map(expand_home),
        }
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"])
            .args(["-o", "ConnectTimeout=5"])
            .args(["-o", "StrictHostKeyChecking=accept-new"]);
        if let Some(port) = self.port {
            cmd.args(["-p", &port.to_string()]);
        }
        if let Some(key) = &self.key {
            cmd.args(["-i", key]);
        }
        cmd.arg(&self.destination)
            .arg(format!("bash -c {}", shell_quote(remote)));
        cmd
    }
}

#[async_trait]
impl Runner for SshRunner {
    async fn run(
        &self,
        ctx: &Context,
        command: &str,
        opts: &RunOptions,
    ) -> Result<String, RunError> {
        let what = format!("ssh to {}", self.destination);
        exec(self.command(command), ctx, opts, &what)
            .await?
            .into_result()
    }

    fn target(&self) -> &str {
        &self.destination
    }
}

/// Expand a leading `~/` to the home directory.
fn expand_home(key: &str) -> String {
    match (key.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home, rest),
        _ => key.to_string(),
    }
}
