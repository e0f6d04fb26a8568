//! NR-042: Lock file management (load, atomic save, build from a run).
//!
//! The lock records what the last run did. It is informational: the engine
//! always re-queries the host instead of trusting it.

use super::executor::ExecutionResult;
use super::graph::Plan;
use super::types::{ResourceLock, StateLock};
use crate::provenance::{eventlog::now_iso8601, hasher};
use crate::resources::Converge;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Derive the lock file path for a machine within the state directory.
pub fn lock_file_path(state_dir: &Path, machine: &str) -> PathBuf {
    state_dir.join(machine).join("state.lock.yaml")
}

/// Load a lock file for a machine. Returns None if the file doesn't exist.
pub fn load_lock(state_dir: &Path, machine: &str) -> Result<Option<StateLock>, String> {
    let path = lock_file_path(state_dir, machine);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let lock: StateLock = serde_yaml_ng::from_str(&content)
        .map_err(|e| format!("invalid lock file {}: {}", path.display(), e))?;
    Ok(Some(lock))
}

/// Save a lock file atomically (write to temp, then rename).
pub fn save_lock(state_dir: &Path, lock: &StateLock) -> Result<(), String> {
    let path = lock_file_path(state_dir, &lock.machine);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create dir {}: {}", parent.display(), e))?;
    }

    let yaml = serde_yaml_ng::to_string(lock).map_err(|e| format!("serialize error: {}", e))?;

    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| {
        format!(
            "cannot rename {} to {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })?;

    Ok(())
}

/// Create a new empty lock for a machine.
pub fn new_lock(machine: &str, hostname: &str) -> StateLock {
    StateLock {
        schema: "1.0".to_string(),
        machine: machine.to_string(),
        hostname: hostname.to_string(),
        generated_at: now_iso8601(),
        generator: format!("noderig {}", env!("CARGO_PKG_VERSION")),
        outcome: String::new(),
        resources: IndexMap::new(),
    }
}

/// Lock describing one plan execution. Resources the run never reached keep
/// their entry from `previous`, if any.
pub fn lock_from_execution(
    machine: &str,
    hostname: &str,
    plan: &Plan,
    result: &ExecutionResult,
    previous: Option<&StateLock>,
) -> StateLock {
    let mut lock = new_lock(machine, hostname);
    lock.outcome = result.outcome().to_string();
    let now = lock.generated_at.clone();

    for node in plan.nodes() {
        let status = result.status(&node.id);
        let touched = status != super::types::ResourceStatus::Unqueried;
        let entry = match previous.and_then(|p| p.resources.get(&node.id)) {
            Some(prev) if !touched => prev.clone(),
            _ => ResourceLock {
                kind: node.resource.kind().tag().to_string(),
                status,
                applied_at: touched.then(|| now.clone()),
                duration_seconds: result.durations.get(&node.id).copied(),
                hash: hasher::hash_desired(&node.resource),
            },
        };
        lock.resources.insert(node.id.clone(), entry);
    }
    lock
}
