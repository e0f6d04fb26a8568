//! NR-026: Arbitrary command resource with an optional guard.

use super::{Converge, ResourceKind};
use crate::core::state::{CommandState, Diff, State};
use crate::error::{ConstructionError, ResourceError, RunError};
use crate::transport::{Context, RunOptions, Runner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const LABEL_WIDTH: usize = 48;

/// Runs `run` unless the `unless` guard exits 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunCommand {
    run: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unless: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    undo: Option<String>,
}

impl RunCommand {
    pub fn new(run: &str) -> Result<Self, ConstructionError> {
        let cmd = Self {
            run: run.to_string(),
            unless: None,
            undo: None,
        };
        cmd.validate()?;
        Ok(cmd)
    }

    pub fn from_fields(fields: serde_yaml_ng::Value) -> Result<Self, ConstructionError> {
        let cmd: Self =
            serde_yaml_ng::from_value(fields).map_err(|e| ConstructionError::InvalidFields {
                kind: "command".to_string(),
                message: e.to_string(),
            })?;
        cmd.validate()?;
        Ok(cmd)
    }

    pub fn unless(mut self, guard: &str) -> Self {
        self.unless = Some(guard.to_string());
        self
    }

    pub fn with_undo(mut self, undo: &str) -> Self {
        self.undo = Some(undo.to_string());
        self
    }

    fn validate(&self) -> Result<(), ConstructionError> {
        if self.run.trim().is_empty() {
            return Err(ConstructionError::EmptyField {
                kind: "command",
                field: "run",
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Converge for RunCommand {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Command
    }

    /// First line of `run`, shortened.
    fn label(&self) -> String {
        let first = self.run.lines().next().unwrap_or_default().trim();
        if first.chars().count() > LABEL_WIDTH {
            let short: String = first.chars().take(LABEL_WIDTH).collect();
            format!("command:{}...", short)
        } else {
            format!("command:{}", first)
        }
    }

    fn state(&self) -> State {
        State::Command(CommandState { satisfied: true })
    }

    async fn query_state(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
    ) -> Result<State, ResourceError> {
        let Some(guard) = &self.unless else {
            return Ok(State::Empty);
        };
        match runner.run(ctx, guard, &RunOptions::default()).await {
            Ok(_) => Ok(State::Command(CommandState { satisfied: true })),
            Err(RunError::Exit { .. }) => {
                Ok(State::Command(CommandState { satisfied: false }))
            }
            Err(e) => Err(ResourceError::query(self.label(), e)),
        }
    }

    fn is_different(&self, current: &State) -> bool {
        !current.as_command().is_some_and(|c| c.satisfied)
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
        runner
            .run(ctx, &self.run, &RunOptions::default())
            .await
            .map_err(|e| ResourceError::apply(self.label(), &self.run, e))?;
        Ok(true)
    }

    async fn undo(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        _current: &State,
    ) -> Result<(), ResourceError> {
        let Some(undo) = &self.undo else {
            return Ok(());
        };
        runner
            .run(ctx, undo, &RunOptions::default())
            .await
            .map_err(|e| ResourceError::undo(self.label(), undo, e))?;
        Ok(())
    }
}
