//! NR-003: Observed/desired state and the diff between them.
//!
//! Each resource kind has its own typed state. `State::Empty` means "not
//! present / not observed" and is distinct from a state with empty values.
//! The generic attribute map exists only for serialization and display.

use crate::error::ResourceError;
use crate::resources::{Converge, Resource};
use crate::transport::{Context, Runner};
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// Scalar attribute value at the serialization boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{}", s),
            Self::Int(i) => write!(f, "{}", i),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Package label: name plus optional version and release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageState {
    pub name: String,
    pub version: Option<String>,
    pub release: Option<String>,
}

impl PackageState {
    pub fn new(name: impl Into<String>, version: Option<&str>, release: Option<&str>) -> Self {
        Self {
            name: name.into(),
            version: version.map(str::to_string),
            release: release.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileState {
    pub path: String,
    /// Hex SHA-256 of the content.
    pub digest: String,
    /// Octal permission bits without leading zeros, e.g. "644".
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandState {
    pub satisfied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceState {
    pub unit: String,
    pub active: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KubeadmState {
    /// Kubeconfig whose presence marks the step as done.
    pub marker: String,
    pub present: bool,
}

/// Desired or observed state of one resource. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum State {
    /// Not present on the host, or never observed.
    Empty,
    Package(PackageState),
    File(FileState),
    Command(CommandState),
    Service(ServiceState),
    Kubeadm(KubeadmState),
}

impl State {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn as_package(&self) -> Option<&PackageState> {
        match self {
            Self::Package(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileState> {
        match self {
            Self::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_command(&self) -> Option<&CommandState> {
        match self {
            Self::Command(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&ServiceState> {
        match self {
            Self::Service(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_kubeadm(&self) -> Option<&KubeadmState> {
        match self {
            Self::Kubeadm(k) => Some(k),
            _ => None,
        }
    }

    /// Ordered attribute map. Empty for `State::Empty`.
    pub fn attributes(&self) -> IndexMap<String, Scalar> {
        let mut attrs = IndexMap::new();
        let mut put = |k: &str, v: Scalar| {
            attrs.insert(k.to_string(), v);
        };
        match self {
            Self::Empty => {}
            Self::Package(p) => {
                put("name", Scalar::Str(p.name.clone()));
                if let Some(v) = &p.version {
                    put("version", Scalar::Str(v.clone()));
                }
                if let Some(r) = &p.release {
                    put("release", Scalar::Str(r.clone()));
                }
            }
            Self::File(f) => {
                put("path", Scalar::Str(f.path.clone()));
                put("digest", Scalar::Str(f.digest.clone()));
                if let Some(m) = &f.mode {
                    put("mode", Scalar::Str(m.clone()));
                }
            }
            Self::Command(c) => put("satisfied", Scalar::Bool(c.satisfied)),
            Self::Service(s) => {
                put("unit", Scalar::Str(s.unit.clone()));
                put("active", Scalar::Bool(s.active));
                put("enabled", Scalar::Bool(s.enabled));
            }
            Self::Kubeadm(k) => {
                put("marker", Scalar::Str(k.marker.clone()));
                put("present", Scalar::Bool(k.present));
            }
        }
        attrs
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "<empty>");
        }
        let parts: Vec<String> = self
            .attributes()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// Desired state paired with a freshly observed current state.
///
/// Only [`Diff::observe`] builds one outside this crate, so a diff always
/// reflects a live query made immediately before use.
#[derive(Debug, Clone)]
pub struct Diff {
    desired: State,
    current: State,
}

impl Diff {
    pub(crate) fn new(desired: State, current: State) -> Self {
        Self { desired, current }
    }

    /// Query the host and pair the result with the resource's desired state.
    pub async fn observe(
        resource: &Resource,
        ctx: &Context,
        runner: &dyn Runner,
    ) -> Result<Self, ResourceError> {
        let current = resource.query_state(ctx, runner).await?;
        Ok(Self::new(resource.state(), current))
    }

    pub fn desired(&self) -> &State {
        &self.desired
    }

    pub fn current(&self) -> &State {
        &self.current
    }
}
