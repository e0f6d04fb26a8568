//! Resource kinds: idempotent, revertible units of host configuration.
//!
//! Every kind implements [`Converge`]:
//! 1. `state` derives the desired state from the resource's own fields
//! 2. `query_state` reads the current state in one round trip
//! 3. `apply` converges only when `is_different` says so
//! 4. `undo` reverses a prior apply, best effort
//!
//! [`Resource`] is the closed set of kinds; the engine dispatches through it.

pub mod command;
pub mod deb;
pub mod file;
pub mod kubeadm;
pub mod package;
pub mod rpm;
pub mod service;
pub mod version;

use crate::core::state::{Diff, State};
use crate::error::ResourceError;
use crate::transport::{Context, Runner};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

pub use command::RunCommand;
pub use deb::Deb;
pub use file::File;
pub use kubeadm::{KubeadmInit, KubeadmJoin};
pub use rpm::Rpm;
pub use service::Service;

/// Kind tag of a resource, as written in manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Rpm,
    Deb,
    File,
    Command,
    Service,
    KubeadmInit,
    KubeadmJoin,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        Self::Rpm,
        Self::Deb,
        Self::File,
        Self::Command,
        Self::Service,
        Self::KubeadmInit,
        Self::KubeadmJoin,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Self::Rpm => "rpm",
            Self::Deb => "deb",
            Self::File => "file",
            Self::Command => "command",
            Self::Service => "service",
            Self::KubeadmInit => "kubeadm_init",
            Self::KubeadmJoin => "kubeadm_join",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Capability set shared by every resource kind.
#[async_trait]
pub trait Converge: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Display label for logs and errors. Never contains secrets.
    fn label(&self) -> String;

    /// Desired state. Pure, no I/O.
    fn state(&self) -> State;

    /// One read-only round trip. "Not present" is `State::Empty`, not an error.
    async fn query_state(&self, ctx: &Context, runner: &dyn Runner)
        -> Result<State, ResourceError>;

    /// No-op is guaranteed if and only if this returns false.
    fn is_different(&self, current: &State) -> bool;

    /// Dry-run check: query, then compare. Never mutates the host.
    async fn would_change_state(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
    ) -> Result<bool, ResourceError> {
        let current = self.query_state(ctx, runner).await?;
        Ok(self.is_different(&current))
    }

    /// Converge. Returns `Ok(false)` without mutating when already converged.
    async fn apply(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        diff: &Diff,
    ) -> Result<bool, ResourceError>;

    /// Reverse a prior apply. `current` is the state observed before it.
    async fn undo(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        current: &State,
    ) -> Result<(), ResourceError>;
}

/// The closed set of resource kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Resource {
    Rpm(Rpm),
    Deb(Deb),
    File(File),
    Command(RunCommand),
    Service(Service),
    KubeadmInit(KubeadmInit),
    KubeadmJoin(KubeadmJoin),
}

macro_rules! dispatch {
    ($self:ident, $r:ident => $body:expr) => {
        match $self {
            Resource::Rpm($r) => $body,
            Resource::Deb($r) => $body,
            Resource::File($r) => $body,
            Resource::Command($r) => $body,
            Resource::Service($r) => $body,
            Resource::KubeadmInit($r) => $body,
            Resource::KubeadmJoin($r) => $body,
        }
    };
}

impl Resource {
    /// Manifest field map of this resource (without the kind tag).
    pub fn fields(&self) -> Result<serde_yaml_ng::Value, serde_yaml_ng::Error> {
        serde_yaml_ng::to_value(self)
    }
}

#[async_trait]
impl Converge for Resource {
    fn kind(&self) -> ResourceKind {
        dispatch!(self, r => r.kind())
    }

    fn label(&self) -> String {
        dispatch!(self, r => r.label())
    }

    fn state(&self) -> State {
        dispatch!(self, r => r.state())
    }

    async fn query_state(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
    ) -> Result<State, ResourceError> {
        dispatch!(self, r => r.query_state(ctx, runner).await)
    }

    fn is_different(&self, current: &State) -> bool {
        dispatch!(self, r => r.is_different(current))
    }

    async fn apply(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        diff: &Diff,
    ) -> Result<bool, ResourceError> {
        dispatch!(self, r => r.apply(ctx, runner, diff).await)
    }

    async fn undo(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        current: &State,
    ) -> Result<(), ResourceError> {
        dispatch!(self, r => r.undo(ctx, runner, current).await)
    }
}
