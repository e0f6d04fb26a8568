//! NR-001: Manifest, lock and event types.
//!
//! Defines the YAML schema for machines, resources and policy, the per-machine
//! lock file, and provenance events. All derive Serialize/Deserialize.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Top-level noderig.yaml
// ============================================================================

/// Root manifest: the desired state of a set of nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Human-readable cluster name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Machine inventory
    #[serde(default)]
    pub machines: IndexMap<String, Machine>,

    /// Resource declarations (order-preserving)
    #[serde(default)]
    pub resources: IndexMap<String, ResourceEntry>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,
}

// ============================================================================
// Machines
// ============================================================================

/// A machine to converge (bare-metal or pre-existing VM).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    /// Machine hostname
    pub hostname: String,

    /// Network address (IP or DNS)
    pub addr: String,

    /// SSH user
    #[serde(default = "default_user")]
    pub user: String,

    /// Path to SSH private key
    #[serde(default)]
    pub ssh_key: Option<String>,

    /// SSH port (default: ssh's own default)
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_user() -> String {
    "root".to_string()
}

impl Machine {
    /// The implicit machine used when a resource targets `localhost`.
    pub fn localhost() -> Self {
        Self {
            hostname: "localhost".to_string(),
            addr: "127.0.0.1".to_string(),
            user: default_user(),
            ssh_key: None,
            port: None,
        }
    }
}

// ============================================================================
// Resources
// ============================================================================

/// One resource declaration. Kind-specific fields stay a generic map until
/// the registry turns them into a typed resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// Registry kind tag (rpm, deb, file, command, service, ...)
    #[serde(rename = "type")]
    pub kind: String,

    /// Target machine(s), single name or list
    #[serde(default)]
    pub machine: MachineTarget,

    /// Resources (same machine) that must converge first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Kind-specific fields
    #[serde(flatten)]
    pub fields: IndexMap<String, serde_yaml_ng::Value>,
}

/// Machine target: single machine or multiple.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MachineTarget {
    Single(String),
    Multiple(Vec<String>),
}

impl Default for MachineTarget {
    fn default() -> Self {
        Self::Single("localhost".to_string())
    }
}

impl MachineTarget {
    /// Expand to a list of machine names.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Single(s) => vec![s.clone()],
            Self::Multiple(v) => v.clone(),
        }
    }

    pub fn contains(&self, machine: &str) -> bool {
        match self {
            Self::Single(s) => s == machine,
            Self::Multiple(v) => v.iter().any(|m| m == machine),
        }
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Converge independent machines concurrently
    #[serde(default)]
    pub parallel_machines: bool,

    /// Persist per-machine lock after each run
    #[serde(default = "default_true")]
    pub lock_file: bool,

    /// Append provenance events to the per-machine JSONL log
    #[serde(default = "default_true")]
    pub event_log: bool,

    /// Deadline for one machine's whole plan execution
    #[serde(default = "default_plan_timeout")]
    pub plan_timeout_secs: u64,

    /// Deadline for the unwind after a failure
    #[serde(default = "default_undo_timeout")]
    pub undo_timeout_secs: u64,

    /// Connection probing before the first query
    #[serde(default)]
    pub reachability: Reachability,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            parallel_machines: false,
            lock_file: true,
            event_log: true,
            plan_timeout_secs: default_plan_timeout(),
            undo_timeout_secs: default_undo_timeout(),
            reachability: Reachability::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_plan_timeout() -> u64 {
    1800
}

fn default_undo_timeout() -> u64 {
    600
}

/// Bounded reachability probing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reachability {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_delay")]
    pub delay_secs: u64,
}

impl Default for Reachability {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_secs: default_delay(),
        }
    }
}

fn default_attempts() -> u32 {
    5
}

fn default_delay() -> u64 {
    3
}

// ============================================================================
// Per-resource status
// ============================================================================

/// Where a resource ended up in one plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Unqueried,
    Queried,
    Unchanged,
    Applying,
    Applied,
    Failed,
    Undoing,
    Undone,
    UndoFailed,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unqueried => write!(f, "UNQUERIED"),
            Self::Queried => write!(f, "QUERIED"),
            Self::Unchanged => write!(f, "UNCHANGED"),
            Self::Applying => write!(f, "APPLYING"),
            Self::Applied => write!(f, "APPLIED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Undoing => write!(f, "UNDOING"),
            Self::Undone => write!(f, "UNDONE"),
            Self::UndoFailed => write!(f, "UNDO-FAILED"),
        }
    }
}

// ============================================================================
// Preview
// ============================================================================

/// Action a preview predicts for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    Create,
    Update,
    NoOp,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::NoOp => write!(f, "NO-OP"),
        }
    }
}

/// A single predicted change.
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub resource_id: String,
    pub label: String,
    pub action: PlanAction,
}

// ============================================================================
// Lock file
// ============================================================================

/// Per-machine lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLock {
    /// Schema version
    pub schema: String,

    /// Machine name
    pub machine: String,

    /// Machine hostname
    pub hostname: String,

    /// When the lock was generated
    pub generated_at: String,

    /// Generator version
    pub generator: String,

    /// Outcome of the run that wrote this lock
    pub outcome: String,

    /// Per-resource state
    pub resources: IndexMap<String, ResourceLock>,
}

/// Per-resource lock entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLock {
    /// Registry kind tag
    pub kind: String,

    /// Status reached in the last run
    pub status: ResourceStatus,

    /// When the resource was last touched
    #[serde(default)]
    pub applied_at: Option<String>,

    /// Duration of the last apply in seconds
    #[serde(default)]
    pub duration_seconds: Option<f64>,

    /// BLAKE3 hash of the desired state
    pub hash: String,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    ApplyStarted {
        machine: String,
        run_id: String,
        noderig_version: String,
    },
    ResourceConverged {
        machine: String,
        resource: String,
        duration_seconds: f64,
        hash: String,
    },
    ResourceUnchanged {
        machine: String,
        resource: String,
    },
    ResourceFailed {
        machine: String,
        resource: String,
        error: String,
        output: String,
    },
    ResourceUndone {
        machine: String,
        resource: String,
    },
    UndoFailed {
        machine: String,
        resource: String,
        error: String,
    },
    ApplyCompleted {
        machine: String,
        run_id: String,
        outcome: String,
        resources_applied: u32,
        resources_unchanged: u32,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}
