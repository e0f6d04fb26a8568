//! NR-050: Seed-node orchestrator for the first control-plane node.
//!
//! 1. identify the OS family from `/etc/os-release`
//! 2. generate (or validate) a kubeadm bootstrap token, unless the control
//!    plane is already initialized
//! 3. resolve the controller image against an optional image repository
//! 4. build and execute the seed plan

use crate::core::executor::{ExecuteOptions, ExecutionResult};
use crate::core::graph::{Edge, Plan};
use crate::core::types::Machine;
use crate::error::{ConstructionError, ResourceError, RunError};
use crate::resources::{Converge, Deb, File, KubeadmInit, Resource, Rpm, RunCommand, Service};
use crate::transport::{Context, RunOptions, Runner};
use rand::Rng;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Where the generated kubeadm configuration is written on the seed node.
pub const KUBEADM_CONFIG_PATH: &str = "/etc/noderig/kubeadm-config.yaml";

/// Controller image deployed when none is given.
pub const DEFAULT_CONTROLLER_IMAGE: &str =
    concat!("quay.io/noderig/controller:", env!("CARGO_PKG_VERSION"));

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

static TOKEN_FORMAT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]{6}\.[a-z0-9]{16}$").ok());

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("cannot read /etc/os-release: {0}")]
    OsRelease(#[source] RunError),

    #[error("unsupported operating system '{id}' (like: {like})")]
    UnsupportedOs { id: String, like: String },

    #[error("/etc/os-release has no ID field")]
    MissingOsId,

    #[error("invalid bootstrap token '{0}': expected [a-z0-9]{{6}}.[a-z0-9]{{16}}")]
    InvalidToken(String),

    #[error("invalid image reference '{0}'")]
    InvalidImage(String),

    #[error("seed plan: {0}")]
    Plan(#[from] ConstructionError),

    #[error("cannot check control-plane state: {0}")]
    ControlPlaneQuery(#[from] ResourceError),
}

/// Package manager family of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Rpm,
    Deb,
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpm => write!(f, "rpm"),
            Self::Deb => write!(f, "deb"),
        }
    }
}

/// Operating system as reported by `/etc/os-release`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsInfo {
    pub id: String,
    pub id_like: Vec<String>,
    pub version_id: Option<String>,
    pub family: OsFamily,
}

fn family_of(id: &str) -> Option<OsFamily> {
    match id {
        "centos" | "rhel" | "fedora" | "rocky" | "almalinux" | "ol" | "amzn" => Some(OsFamily::Rpm),
        "debian" | "ubuntu" => Some(OsFamily::Deb),
        _ => None,
    }
}

/// Parse `/etc/os-release`. `ID` decides the family; `ID_LIKE` is the fallback.
pub fn parse_os_release(content: &str) -> Result<OsInfo, SeedError> {
    let mut id = None;
    let mut id_like = Vec::new();
    let mut version_id = None;
    for line in content.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        match key {
            "ID" => id = Some(value.to_lowercase()),
            "ID_LIKE" => id_like = value.split_whitespace().map(str::to_lowercase).collect(),
            "VERSION_ID" => version_id = Some(value.to_string()),
            _ => {}
        }
    }
    let id = id.filter(|i| !i.is_empty()).ok_or(SeedError::MissingOsId)?;
    let family = family_of(&id)
        .or_else(|| id_like.iter().find_map(|like| family_of(like)))
        .ok_or_else(|| SeedError::UnsupportedOs {
            id: id.clone(),
            like: id_like.join(" "),
        })?;
    Ok(OsInfo {
        id,
        id_like,
        version_id,
        family,
    })
}

/// Read and classify the host's OS in one round trip.
pub async fn identify_os(ctx: &Context, runner: &dyn Runner) -> Result<OsInfo, SeedError> {
    let out = runner
        .run(ctx, "cat /etc/os-release", &RunOptions::default())
        .await
        .map_err(SeedError::OsRelease)?;
    parse_os_release(&out)
}

/// Random kubeadm bootstrap token, `[a-z0-9]{6}.[a-z0-9]{16}`.
pub fn generate_bootstrap_token() -> String {
    let mut rng = rand::thread_rng();
    let mut pick = |n: usize| -> String {
        (0..n)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect()
    };
    let id = pick(6);
    let secret = pick(16);
    format!("{}.{}", id, secret)
}

pub fn validate_token(token: &str) -> Result<(), SeedError> {
    match TOKEN_FORMAT.as_ref() {
        Some(re) if re.is_match(token) => Ok(()),
        _ => Err(SeedError::InvalidToken(token.to_string())),
    }
}

/// Rehome `image` under `repository`, keeping its name and tag.
///
/// `quay.io/noderig/controller:v1` with `registry.local:5000/mirror` becomes
/// `registry.local:5000/mirror/controller:v1`. No repository leaves the image
/// unchanged.
pub fn resolve_image(image: &str, repository: Option<&str>) -> Result<String, SeedError> {
    let image = image.trim();
    let last = image.rsplit('/').next().unwrap_or(image);
    if image.is_empty() || last.is_empty() || last.starts_with(':') || last.starts_with('@') {
        return Err(SeedError::InvalidImage(image.to_string()));
    }
    match repository.map(|r| r.trim().trim_end_matches('/')) {
        None | Some("") => Ok(image.to_string()),
        Some(repo) => Ok(format!("{}/{}", repo, last)),
    }
}

/// Inputs of the seed flow.
#[derive(Debug, Clone)]
pub struct SeedParams {
    /// Kubernetes version without the leading `v`, e.g. `1.14.1`.
    pub kubernetes_version: String,
    /// Reused instead of generating a fresh one.
    pub token: Option<String>,
    pub image_repository: Option<String>,
    pub controller_image: String,
    /// Address the API server advertises; kubeadm picks one when unset.
    pub advertise_address: Option<String>,
    pub pod_subnet: Option<String>,
    pub undo_timeout: Duration,
}

impl Default for SeedParams {
    fn default() -> Self {
        Self {
            kubernetes_version: "1.14.1".to_string(),
            token: None,
            image_repository: None,
            controller_image: DEFAULT_CONTROLLER_IMAGE.to_string(),
            advertise_address: None,
            pod_subnet: None,
            undo_timeout: Duration::from_secs(600),
        }
    }
}

impl SeedParams {
    /// Defaults with the advertise address taken from the machine.
    pub fn for_machine(machine: &Machine) -> Self {
        Self {
            advertise_address: Some(machine.addr.clone()),
            ..Self::default()
        }
    }
}

/// What the seed flow did.
#[derive(Debug)]
pub struct SeedReport {
    pub os: OsInfo,
    /// `None` when the host was already initialized: its existing bootstrap
    /// tokens are left alone.
    pub token: Option<String>,
    pub controller_image: String,
    pub result: ExecutionResult,
}

/// kubeadm configuration handed to `kubeadm init --config`.
pub fn kubeadm_config(params: &SeedParams, token: &str) -> String {
    let mut out = String::new();
    out.push_str("apiVersion: kubeadm.k8s.io/v1beta1\n");
    out.push_str("kind: InitConfiguration\n");
    out.push_str("bootstrapTokens:\n");
    out.push_str(&format!("- token: \"{}\"\n", token));
    out.push_str("  ttl: \"24h0m0s\"\n");
    if let Some(addr) = &params.advertise_address {
        out.push_str("localAPIEndpoint:\n");
        out.push_str(&format!("  advertiseAddress: \"{}\"\n", addr));
    }
    out.push_str("---\n");
    out.push_str("apiVersion: kubeadm.k8s.io/v1beta1\n");
    out.push_str("kind: ClusterConfiguration\n");
    out.push_str(&format!(
        "kubernetesVersion: \"v{}\"\n",
        params.kubernetes_version.trim_start_matches('v')
    ));
    if let Some(repo) = params.image_repository.as_deref().filter(|r| !r.is_empty()) {
        out.push_str(&format!("imageRepository: \"{}\"\n", repo));
    }
    if let Some(subnet) = &params.pod_subnet {
        out.push_str("networking:\n");
        out.push_str(&format!("  podSubnet: \"{}\"\n", subnet));
    }
    out
}

fn package(family: OsFamily, name: &str, version: Option<&str>) -> Result<Resource, SeedError> {
    Ok(match family {
        // kubernetes repos ship kubelet/kubeadm behind an exclude
        OsFamily::Rpm => Resource::Rpm(Rpm::new(name, version, None)?.disable_excludes("kubernetes")),
        OsFamily::Deb => Resource::Deb(Deb::new(name, version, version.map(|_| "00"))?),
    })
}

/// The plan converging a bare host into an initialized control plane.
///
/// Without a token the kubeadm config file is left out of the plan.
pub fn build_seed_plan(
    name: &str,
    family: OsFamily,
    params: &SeedParams,
    token: Option<&str>,
) -> Result<Plan, SeedError> {
    let version = params.kubernetes_version.trim_start_matches('v');
    let (runtime_pkg, runtime_unit) = match family {
        OsFamily::Rpm => ("docker", "docker"),
        OsFamily::Deb => ("docker.io", "docker"),
    };
    let runtime = match family {
        OsFamily::Rpm => Resource::Rpm(Rpm::new(runtime_pkg, None, None)?),
        OsFamily::Deb => Resource::Deb(Deb::new(runtime_pkg, None, None)?),
    };

    let mut resources = vec![
        ("container-runtime".to_string(), runtime),
        (
            "container-runtime-service".to_string(),
            Resource::Service(Service::new(runtime_unit)),
        ),
        (
            "swap-off".to_string(),
            Resource::Command(
                RunCommand::new("swapoff -a")?
                    .unless("test -z \"$(swapon --noheadings 2>/dev/null)\""),
            ),
        ),
        ("kubelet".to_string(), package(family, "kubelet", Some(version))?),
        ("kubeadm".to_string(), package(family, "kubeadm", Some(version))?),
        ("kubectl".to_string(), package(family, "kubectl", Some(version))?),
        (
            "kubelet-service".to_string(),
            Resource::Service(Service::new("kubelet")),
        ),
        (
            "kubeadm-init".to_string(),
            Resource::KubeadmInit(KubeadmInit::new().with_config(KUBEADM_CONFIG_PATH)),
        ),
    ];

    let edge = |before: &str, after: &str| -> Edge { (before.to_string(), after.to_string()) };
    let mut edges = vec![
        edge("container-runtime", "container-runtime-service"),
        edge("container-runtime", "kubelet"),
        edge("kubelet", "kubeadm"),
        edge("kubelet", "kubectl"),
        edge("kubelet", "kubelet-service"),
        edge("kubeadm", "kubeadm-init"),
        edge("container-runtime-service", "kubeadm-init"),
        edge("swap-off", "kubeadm-init"),
        edge("kubelet-service", "kubeadm-init"),
    ];
    if let Some(token) = token {
        let config = File::new(KUBEADM_CONFIG_PATH, &kubeadm_config(params, token))?.with_mode("600")?;
        resources.insert(6, ("kubeadm-config".to_string(), Resource::File(config)));
        edges.push(edge("kubeadm", "kubeadm-config"));
        edges.push(edge("kubeadm-config", "kubeadm-init"));
    }

    Ok(Plan::build(name, resources, &edges)?)
}

/// Identify the host, prepare token and image, then execute the seed plan.
///
/// A failed plan is not an `Err`: the report carries the execution result,
/// including the unwind outcome.
pub async fn setup_seed_node(
    ctx: &Context,
    runner: &dyn Runner,
    params: &SeedParams,
) -> Result<SeedReport, SeedError> {
    let os = identify_os(ctx, runner).await?;
    info!(os = %os.id, family = %os.family, "identified seed node");

    if let Some(t) = &params.token {
        validate_token(t)?;
    }
    let controller_image =
        resolve_image(&params.controller_image, params.image_repository.as_deref())?;

    // A token written after init is never registered with the cluster.
    let initialized = !KubeadmInit::new().query_state(ctx, runner).await?.is_empty();
    let token = if initialized {
        info!("control plane already initialized, keeping its bootstrap configuration");
        None
    } else {
        Some(params.token.clone().unwrap_or_else(generate_bootstrap_token))
    };

    let plan = build_seed_plan("seed", os.family, params, token.as_deref())?;
    info!(resources = plan.len(), image = %controller_image, "executing seed plan");
    let opts = ExecuteOptions::default().with_undo_timeout(params.undo_timeout);
    let result = plan.execute(ctx, runner, &opts).await;

    Ok(SeedReport {
        os,
        token,
        controller_image,
        result,
    })
}
