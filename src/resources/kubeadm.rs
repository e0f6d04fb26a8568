//! NR-028: kubeadm init/join resources.
//!
//! Both are present once their kubeconfig marker exists. Undo is
//! `kubeadm reset --force`. Join secrets never appear in labels or errors.

use super::{Converge, ResourceKind};
use crate::core::state::{Diff, KubeadmState, State};
use crate::error::{ConstructionError, ResourceError, RunError};
use crate::transport::{shell_arg, shell_quote, Context, RunOptions, Runner};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";
pub const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";
const RESET: &str = "kubeadm reset --force";
const REDACTED: &str = "<redacted>";

async fn query_marker(
    label: String,
    marker: &str,
    ctx: &Context,
    runner: &dyn Runner,
) -> Result<State, ResourceError> {
    let cmd = format!(
        "test -f {} && echo present || echo absent",
        shell_quote(marker)
    );
    let output = runner
        .run(ctx, &cmd, &RunOptions::default())
        .await
        .map_err(|e| ResourceError::query(&label, e))?;
    match output.trim() {
        "present" => Ok(State::Kubeadm(KubeadmState {
            marker: marker.to_string(),
            present: true,
        })),
        "absent" => Ok(State::Empty),
        _ => Err(ResourceError::malformed(
            label,
            "expected 'present' or 'absent'",
            &output,
        )),
    }
}

fn marker_present(current: &State) -> bool {
    current.as_kubeadm().is_some_and(|k| k.present)
}

async fn reset(label: String, ctx: &Context, runner: &dyn Runner) -> Result<(), ResourceError> {
    runner
        .run(ctx, RESET, &RunOptions::default())
        .await
        .map_err(|e| ResourceError::undo(label, RESET, e))?;
    Ok(())
}

fn invalid(kind: &str, e: serde_yaml_ng::Error) -> ConstructionError {
    ConstructionError::InvalidFields {
        kind: kind.to_string(),
        message: e.to_string(),
    }
}

/// `kubeadm init` on the first control-plane node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubeadmInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    ignore_preflight_errors: Vec<String>,
}

impl KubeadmInit {
    pub fn new() -> Self {
        Self {
            config_path: None,
            ignore_preflight_errors: Vec::new(),
        }
    }

    pub fn from_fields(fields: serde_yaml_ng::Value) -> Result<Self, ConstructionError> {
        serde_yaml_ng::from_value(fields).map_err(|e| invalid("kubeadm_init", e))
    }

    pub fn with_config(mut self, path: &str) -> Self {
        self.config_path = Some(path.to_string());
        self
    }

    pub fn ignore_preflight_error(mut self, check: &str) -> Self {
        self.ignore_preflight_errors.push(check.to_string());
        self
    }

    pub fn command(&self) -> String {
        let mut cmd = "kubeadm init".to_string();
        if let Some(path) = &self.config_path {
            cmd.push_str(&format!(" --config {}", shell_arg(path)));
        }
        if !self.ignore_preflight_errors.is_empty() {
            cmd.push_str(&format!(
                " --ignore-preflight-errors={}",
                shell_arg(&self.ignore_preflight_errors.join(","))
            ));
        }
        cmd
    }
}

impl Default for KubeadmInit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Converge for KubeadmInit {
    fn kind(&self) -> ResourceKind {
        ResourceKind::KubeadmInit
    }

    fn label(&self) -> String {
        match &self.config_path {
            Some(path) => format!("kubeadm_init:{}", path),
            None => "kubeadm_init".to_string(),
        }
    }

    fn state(&self) -> State {
        State::Kubeadm(KubeadmState {
            marker: ADMIN_CONF.to_string(),
            present: true,
        })
    }

    async fn query_state(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
    ) -> Result<State, ResourceError> {
        query_marker(self.label(), ADMIN_CONF, ctx, runner).await
    }

    fn is_different(&self, current: &State) -> bool {
        !marker_present(current)
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
        let cmd = self.command();
        runner
            .run(ctx, &cmd, &RunOptions::default())
            .await
            .map_err(|e| ResourceError::apply(self.label(), &cmd, e))?;
        Ok(true)
    }

    async fn undo(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        _current: &State,
    ) -> Result<(), ResourceError> {
        reset(self.label(), ctx, runner).await
    }
}

/// `kubeadm join` of a worker or additional control-plane node.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubeadmJoin {
    api_server_endpoint: String,
    token: String,
    ca_cert_hash: String,
    #[serde(default)]
    control_plane: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    certificate_key: Option<String>,
}

impl std::fmt::Debug for KubeadmJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeadmJoin")
            .field("api_server_endpoint", &self.api_server_endpoint)
            .field("token", &REDACTED)
            .field("ca_cert_hash", &self.ca_cert_hash)
            .field("control_plane", &self.control_plane)
            .field(
                "certificate_key",
                &self.certificate_key.as_ref().map(|_| REDACTED),
            )
            .finish()
    }
}

impl KubeadmJoin {
    pub fn new(
        api_server_endpoint: &str,
        token: &str,
        ca_cert_hash: &str,
    ) -> Result<Self, ConstructionError> {
        let join = Self {
            api_server_endpoint: api_server_endpoint.to_string(),
            token: token.to_string(),
            ca_cert_hash: ca_cert_hash.to_string(),
            control_plane: false,
            certificate_key: None,
        };
        join.validate()?;
        Ok(join)
    }

    pub fn from_fields(fields: serde_yaml_ng::Value) -> Result<Self, ConstructionError> {
        let join: Self =
            serde_yaml_ng::from_value(fields).map_err(|e| invalid("kubeadm_join", e))?;
        join.validate()?;
        Ok(join)
    }

    pub fn control_plane(mut self, certificate_key: Option<&str>) -> Self {
        self.control_plane = true;
        self.certificate_key = certificate_key.map(str::to_string);
        self
    }

    fn validate(&self) -> Result<(), ConstructionError> {
        for (field, value) in [
            ("api_server_endpoint", &self.api_server_endpoint),
            ("token", &self.token),
            ("ca_cert_hash", &self.ca_cert_hash),
        ] {
            if value.trim().is_empty() {
                return Err(ConstructionError::EmptyField {
                    kind: "kubeadm_join",
                    field,
                });
            }
        }
        if self.certificate_key.is_some() && !self.control_plane {
            return Err(ConstructionError::InvalidFields {
                kind: "kubeadm_join".to_string(),
                message: "certificate_key requires control_plane".to_string(),
            });
        }
        Ok(())
    }

    fn render(&self, token: &str, certificate_key: Option<&str>) -> String {
        let mut cmd = format!(
            "kubeadm join {} --token {} --discovery-token-ca-cert-hash {}",
            shell_arg(&self.api_server_endpoint),
            token,
            shell_arg(&self.ca_cert_hash)
        );
        if self.control_plane {
            cmd.push_str(" --control-plane");
            if let Some(key) = certificate_key {
                cmd.push_str(&format!(" --certificate-key {}", key));
            }
        }
        cmd
    }

    /// Command sent to the host.
    fn command(&self) -> String {
        let token = shell_arg(&self.token);
        let key = self.certificate_key.as_deref().map(shell_arg);
        self.render(&token, key.as_deref())
    }

    /// Same command with secrets masked, for errors and logs.
    pub fn display_command(&self) -> String {
        self.render(REDACTED, self.certificate_key.as_ref().map(|_| REDACTED))
    }
}

#[async_trait]
impl Converge for KubeadmJoin {
    fn kind(&self) -> ResourceKind {
        ResourceKind::KubeadmJoin
    }

    fn label(&self) -> String {
        format!("kubeadm_join:{}", self.api_server_endpoint)
    }

    fn state(&self) -> State {
        State::Kubeadm(KubeadmState {
            marker: KUBELET_CONF.to_string(),
            present: true,
        })
    }

    async fn query_state(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
    ) -> Result<State, ResourceError> {
        query_marker(self.label(), KUBELET_CONF, ctx, runner).await
    }

    fn is_different(&self, current: &State) -> bool {
        !marker_present(current)
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
            .run(ctx, &self.command(), &RunOptions::default())
            .await
            .map_err(|e| {
                let e = redact(e, &self.token, self.certificate_key.as_deref());
                ResourceError::apply(self.label(), self.display_command(), e)
            })?;
        Ok(true)
    }

    async fn undo(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        _current: &State,
    ) -> Result<(), ResourceError> {
        reset(self.label(), ctx, runner).await
    }
}

/// kubeadm echoes its flags on some failures.
fn redact(err: RunError, token: &str, key: Option<&str>) -> RunError {
    match err {
        RunError::Exit { exit_code, output } => {
            let mut output = output.replace(token, REDACTED);
            if let Some(key) = key {
                output = output.replace(key, REDACTED);
            }
            RunError::Exit { exit_code, output }
        }
        other => other,
    }
}
