//! NR-012: Local execution runner.

use super::{exec, Context, RunOptions, Runner};
use crate::error::RunError;
use async_trait::async_trait;
use tokio::process::Command;

/// Runs commands on this machine via `bash -c`.
/// Uses bash (not sh/dash) because commands may rely on `set -o pipefail`.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

impl LocalRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runner for LocalRunner {
    async fn run(
        &self,
        ctx: &Context,
        command: &str,
        opts: &RunOptions,
    ) -> Result<String, RunError> {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        exec(cmd, ctx, opts, "bash").await?.into_result()
    }

    fn target(&self) -> &str {
        "local"
    }
}
