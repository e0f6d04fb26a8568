//! NR-025: Managed file resource.

use super::{Converge, ResourceKind};
use crate::core::state::{Diff, FileState, State};
use crate::error::{ConstructionError, ResourceError};
use crate::transport::{shell_quote, Context, RunOptions, Runner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Suffix of the copy taken before an existing file is overwritten.
pub const BACKUP_SUFFIX: &str = ".noderig.bak";

/// A file with exact content and an optional octal mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct File {
    path: String,
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
}

impl File {
    pub fn new(path: &str, content: &str) -> Result<Self, ConstructionError> {
        let file = Self {
            path: path.to_string(),
            content: content.to_string(),
            mode: None,
        };
        file.validate()?;
        Ok(file)
    }

    pub fn from_fields(fields: serde_yaml_ng::Value) -> Result<Self, ConstructionError> {
        let file: Self =
            serde_yaml_ng::from_value(fields).map_err(|e| ConstructionError::InvalidFields {
                kind: "file".to_string(),
                message: e.to_string(),
            })?;
        file.validate()?;
        Ok(file)
    }

    pub fn with_mode(mut self, mode: &str) -> Result<Self, ConstructionError> {
        self.mode = Some(mode.to_string());
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConstructionError> {
        if self.path.trim().is_empty() {
            return Err(ConstructionError::EmptyField {
                kind: "file",
                field: "path",
            });
        }
        if !self.path.starts_with('/') {
            return Err(ConstructionError::InvalidFields {
                kind: "file".to_string(),
                message: format!("path '{}' must be absolute", self.path),
            });
        }
        if let Some(mode) = &self.mode {
            if mode.is_empty() || !mode.chars().all(|c| ('0'..='7').contains(&c)) || mode.len() > 4
            {
                return Err(ConstructionError::InvalidFields {
                    kind: "file".to_string(),
                    message: format!("mode '{}' is not octal", mode),
                });
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn backup_path(&self) -> String {
        format!("{}{}", self.path, BACKUP_SUFFIX)
    }

    fn query_command(&self) -> String {
        let p = shell_quote(&self.path);
        format!(
            "if [ -f {p} ]; then stat -c '%a' {p} && sha256sum {p} | cut -d' ' -f1; else echo MISSING; fi"
        )
    }

    fn parse_query(&self, output: &str) -> Result<State, ResourceError> {
        let lines: Vec<&str> = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        match lines.as_slice() {
            ["MISSING"] => Ok(State::Empty),
            [mode, digest] if digest.len() == 64 => Ok(State::File(FileState {
                path: self.path.clone(),
                digest: digest.to_string(),
                mode: Some(normalize_mode(mode)),
            })),
            _ => Err(ResourceError::malformed(
                self.label(),
                "expected MISSING or mode and sha256 lines",
                output,
            )),
        }
    }

    /// Shell script that writes stdin to the path. `backup` copies the
    /// existing file aside first.
    fn write_script(&self, backup: bool) -> String {
        let p = shell_quote(&self.path);
        let mut lines = vec!["set -euo pipefail".to_string()];
        if let Some(parent) = Path::new(&self.path).parent() {
            if parent != Path::new("/") {
                lines.push(format!(
                    "mkdir -p {}",
                    shell_quote(&parent.display().to_string())
                ));
            }
        }
        if backup {
            lines.push(format!("cp -p {} {}", p, shell_quote(&self.backup_path())));
        }
        lines.push(format!("cat > {}", p));
        if let Some(mode) = &self.mode {
            lines.push(format!("chmod {} {}", mode, p));
        }
        lines.join("\n")
    }
}

/// Hex SHA-256 of the content.
pub fn sha256_hex(content: &str) -> String {
    Sha256::digest(content.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// "0644" and "644" are the same mode.
fn normalize_mode(mode: &str) -> String {
    let trimmed = mode.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl Converge for File {
    fn kind(&self) -> ResourceKind {
        ResourceKind::File
    }

    fn label(&self) -> String {
        format!("file:{}", self.path)
    }

    fn state(&self) -> State {
        State::File(FileState {
            path: self.path.clone(),
            digest: sha256_hex(&self.content),
            mode: self.mode.as_deref().map(normalize_mode),
        })
    }

    async fn query_state(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
    ) -> Result<State, ResourceError> {
        let output = runner
            .run(ctx, &self.query_command(), &RunOptions::default())
            .await
            .map_err(|e| ResourceError::query(self.label(), e))?;
        self.parse_query(&output)
    }

    fn is_different(&self, current: &State) -> bool {
        let Some(current) = current.as_file() else {
            return true;
        };
        if current.digest != sha256_hex(&self.content) {
            return true;
        }
        match &self.mode {
            Some(mode) => current.mode.as_deref() != Some(normalize_mode(mode).as_str()),
            None => false,
        }
    }

    async fn apply(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        diff: &Diff,
    ) -> Result<bool, ResourceError> {
        if !self.is_different(diff.current()) {
            return Ok(false);
        }
        let script = self.write_script(!diff.current().is_empty());
        runner
            .run(ctx, &script, &RunOptions::with_stdin(self.content.clone()))
            .await
            .map_err(|e| ResourceError::apply(self.label(), &script, e))?;
        Ok(true)
    }

    async fn undo(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        current: &State,
    ) -> Result<(), ResourceError> {
        let cmd = if current.is_empty() {
            format!("rm -f {}", shell_quote(&self.path))
        } else {
            format!(
                "mv -f {} {}",
                shell_quote(&self.backup_path()),
                shell_quote(&self.path)
            )
        };
        runner
            .run(ctx, &cmd, &RunOptions::default())
            .await
            .map_err(|e| ResourceError::undo(self.label(), &cmd, e))?;
        Ok(())
    }
}
