//! NR-032: Manifest parsing, validation and per-machine plan construction.
//!
//! Validation collects every problem instead of stopping at the first:
//! - version must be "1.0" and name must not be empty
//! - machine references must exist (or be `localhost`)
//! - depends_on references must exist and not be self-references
//! - every resource must construct through the registry

use super::graph::{Edge, Plan};
use super::registry::Registry;
use super::types::{Machine, Manifest};
use crate::error::ConstructionError;
use crate::resources::Resource;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// One validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn invalid(message: String) -> ValidationError {
    ValidationError { message }
}

fn list(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Failure to turn a manifest into plans.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("{} validation error(s):\n{}", .0.len(), list(.0))]
    Invalid(Vec<ValidationError>),

    #[error("machine '{0}' is not targeted by any resource")]
    UnknownMachine(String),

    #[error("machine '{machine}': {source}")]
    Plan {
        machine: String,
        #[source]
        source: ConstructionError,
    },
}

/// A machine together with the plan that converges it.
#[derive(Debug, Clone)]
pub struct MachinePlan {
    pub name: String,
    pub machine: Machine,
    pub plan: Plan,
}

/// Parse a manifest file from disk.
pub fn parse_manifest_file(path: &Path) -> Result<Manifest, ManifestError> {
    let content = std::fs::read_to_string(path).map_err(|e| ManifestError::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    parse_manifest(&content)
}

/// Parse a manifest from a string.
pub fn parse_manifest(yaml: &str) -> Result<Manifest, ManifestError> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Validate a parsed manifest. Returns every problem found (empty = valid).
pub fn validate_manifest(manifest: &Manifest, registry: &Registry) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if manifest.version != "1.0" {
        errors.push(invalid(format!(
            "version must be \"1.0\", got \"{}\"",
            manifest.version
        )));
    }
    if manifest.name.trim().is_empty() {
        errors.push(invalid("name must not be empty".to_string()));
    }

    for (id, entry) in &manifest.resources {
        for machine in entry.machine.to_vec() {
            if !manifest.machines.contains_key(&machine) && machine != "localhost" {
                errors.push(invalid(format!(
                    "resource '{}' references unknown machine '{}'",
                    id, machine
                )));
            }
        }

        for dep in &entry.depends_on {
            if dep == id {
                errors.push(invalid(format!("resource '{}' depends on itself", id)));
            } else if !manifest.resources.contains_key(dep) {
                errors.push(invalid(format!(
                    "resource '{}' depends on unknown resource '{}'",
                    id, dep
                )));
            }
        }

        if let Err(e) = registry.construct_map(&entry.kind, &entry.fields) {
            errors.push(invalid(format!("resource '{}': {}", id, e)));
        }
    }

    errors
}

/// Machines targeted by at least one resource, in manifest order.
/// `localhost` comes last when used without being declared.
pub fn targeted_machines(manifest: &Manifest) -> Vec<String> {
    let targeted = |name: &str| {
        manifest
            .resources
            .values()
            .any(|entry| entry.machine.contains(name))
    };
    let mut names: Vec<String> = manifest
        .machines
        .keys()
        .filter(|name| targeted(name))
        .cloned()
        .collect();
    if !manifest.machines.contains_key("localhost") && targeted("localhost") {
        names.push("localhost".to_string());
    }
    names
}

/// Look up a machine, falling back to the implicit `localhost`.
pub fn resolve_machine(manifest: &Manifest, name: &str) -> Option<Machine> {
    match manifest.machines.get(name) {
        Some(m) => Some(m.clone()),
        None if name == "localhost" => Some(Machine::localhost()),
        None => None,
    }
}

/// Build the plan for one machine. A dependency edge is kept only when both
/// ends target this machine.
pub fn build_machine_plan(
    manifest: &Manifest,
    registry: &Registry,
    name: &str,
) -> Result<MachinePlan, ManifestError> {
    let machine =
        resolve_machine(manifest, name).ok_or_else(|| ManifestError::UnknownMachine(name.into()))?;
    let plan_error = |source| ManifestError::Plan {
        machine: name.to_string(),
        source,
    };

    let mut resources: Vec<(String, Resource)> = Vec::new();
    let mut edges: Vec<Edge> = Vec::new();
    for (id, entry) in &manifest.resources {
        if !entry.machine.contains(name) {
            continue;
        }
        let resource = registry
            .construct_map(&entry.kind, &entry.fields)
            .map_err(plan_error)?;
        resources.push((id.clone(), resource));
        for dep in &entry.depends_on {
            let same_machine = manifest
                .resources
                .get(dep)
                .is_some_and(|d| d.machine.contains(name));
            if same_machine {
                edges.push((dep.clone(), id.clone()));
            }
        }
    }

    let plan = Plan::build(name, resources, &edges).map_err(plan_error)?;
    Ok(MachinePlan {
        name: name.to_string(),
        machine,
        plan,
    })
}

/// Validate the manifest and build one plan per targeted machine.
pub fn build_plans(
    manifest: &Manifest,
    registry: &Registry,
    machine_filter: Option<&str>,
) -> Result<Vec<MachinePlan>, ManifestError> {
    let errors = validate_manifest(manifest, registry);
    if !errors.is_empty() {
        return Err(ManifestError::Invalid(errors));
    }
    let names = targeted_machines(manifest);
    if let Some(filter) = machine_filter {
        if !names.iter().any(|n| n == filter) {
            return Err(ManifestError::UnknownMachine(filter.to_string()));
        }
    }
    names
        .iter()
        .filter(|n| machine_filter.is_none_or(|f| f == n.as_str()))
        .map(|n| build_machine_plan(manifest, registry, n))
        .collect()
}
