//! NR-027: Systemd service resource.

use super::{Converge, ResourceKind};
use crate::core::state::{Diff, ServiceState, State};
use crate::error::{ConstructionError, ResourceError};
use crate::transport::{shell_arg, Context, RunOptions, Runner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

fn yes() -> bool {
    true
}

/// A systemd unit that should be running and enabled (by default).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Service {
    unit: String,
    #[serde(default = "yes")]
    running: bool,
    #[serde(default = "yes")]
    enabled: bool,
}

impl Service {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            running: true,
            enabled: true,
        }
    }

    pub fn from_fields(fields: serde_yaml_ng::Value) -> Result<Self, ConstructionError> {
        let svc: Self =
            serde_yaml_ng::from_value(fields).map_err(|e| ConstructionError::InvalidFields {
                kind: "service".to_string(),
                message: e.to_string(),
            })?;
        if svc.unit.trim().is_empty() {
            return Err(ConstructionError::EmptyField {
                kind: "service",
                field: "unit",
            });
        }
        Ok(svc)
    }

    pub fn stopped(mut self) -> Self {
        self.running = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn query_command(&self) -> String {
        let u = shell_arg(&self.unit);
        format!(
            "printf '%s %s\\n' \"$(systemctl is-active {u} 2>/dev/null)\" \"$(systemctl is-enabled {u} 2>/dev/null)\""
        )
    }

    fn parse_query(&self, output: &str) -> Result<State, ResourceError> {
        let mut fields = output.split_whitespace();
        let Some(active) = fields.next() else {
            return Err(ResourceError::malformed(
                self.label(),
                "empty systemctl output",
                output,
            ));
        };
        let enabled = match fields.next() {
            None | Some("not-found") => return Ok(State::Empty),
            Some(e) => matches!(e, "enabled" | "enabled-runtime" | "static" | "alias"),
        };
        Ok(State::Service(ServiceState {
            unit: self.unit.clone(),
            active: active == "active",
            enabled,
        }))
    }

    /// Commands that move the unit from `from` to `to`, enable before start
    /// and stop before disable.
    fn transitions(&self, from: (bool, bool), to: (bool, bool)) -> Vec<String> {
        let (from_active, from_enabled) = from;
        let (to_active, to_enabled) = to;
        let u = shell_arg(&self.unit);
        let mut cmds = Vec::new();
        if to_enabled && !from_enabled {
            cmds.push(format!("systemctl enable {}", u));
        }
        if to_active != from_active {
            let verb = if to_active { "start" } else { "stop" };
            cmds.push(format!("systemctl {} {}", verb, u));
        }
        if !to_enabled && from_enabled {
            cmds.push(format!("systemctl disable {}", u));
        }
        cmds
    }

    async fn run_all(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        cmds: &[String],
        undo: bool,
    ) -> Result<(), ResourceError> {
        for cmd in cmds {
            runner
                .run(ctx, cmd, &RunOptions::default())
                .await
                .map_err(|e| {
                    if undo {
                        ResourceError::undo(self.label(), cmd, e)
                    } else {
                        ResourceError::apply(self.label(), cmd, e)
                    }
                })?;
        }
        Ok(())
    }
}

/// (active, enabled); a unit that was not there counts as stopped and disabled.
fn observed(state: &State) -> (bool, bool) {
    state
        .as_service()
        .map(|s| (s.active, s.enabled))
        .unwrap_or((false, false))
}

#[async_trait]
impl Converge for Service {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Service
    }

    fn label(&self) -> String {
        format!("service:{}", self.unit)
    }

    fn state(&self) -> State {
        State::Service(ServiceState {
            unit: self.unit.clone(),
            active: self.running,
            enabled: self.enabled,
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
        observed(current) != (self.running, self.enabled)
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
        let cmds = self.transitions(observed(diff.current()), (self.running, self.enabled));
        self.run_all(ctx, runner, &cmds, false).await?;
        Ok(!cmds.is_empty())
    }

    async fn undo(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        current: &State,
    ) -> Result<(), ResourceError> {
        let cmds = self.transitions((self.running, self.enabled), observed(current));
        self.run_all(ctx, runner, &cmds, true).await
    }
}
