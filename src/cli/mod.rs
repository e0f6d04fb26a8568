//! NR-060: CLI subcommands (validate, plan, apply, status, seed).

use crate::core::executor::{self, ApplyConfig, ExecutionResult, MachineResult, Outcome};
use crate::core::lock;
use crate::core::parser::{self, MachinePlan};
use crate::core::registry::Registry;
use crate::core::types::{Machine, Manifest, PlanAction};
use crate::provenance::eventlog;
use crate::seed::{self, SeedParams};
use crate::transport::{self, Context};
use clap::Subcommand;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate noderig.yaml without connecting to machines
    Validate {
        /// Path to noderig.yaml
        #[arg(short, long, default_value = "noderig.yaml")]
        file: PathBuf,
    },

    /// Query every machine and show what apply would change
    Plan {
        /// Path to noderig.yaml
        #[arg(short, long, default_value = "noderig.yaml")]
        file: PathBuf,

        /// Target specific machine
        #[arg(short, long)]
        machine: Option<String>,
    },

    /// Converge machines to the desired state
    Apply {
        /// Path to noderig.yaml
        #[arg(short, long, default_value = "noderig.yaml")]
        file: PathBuf,

        /// Target specific machine
        #[arg(short, long)]
        machine: Option<String>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Show the last run of each machine from lock files
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Target specific machine
        #[arg(short, long)]
        machine: Option<String>,

        /// Also print the last N provenance events
        #[arg(long, default_value_t = 0)]
        events: usize,
    },

    /// Bootstrap the first control-plane node
    Seed {
        /// Address of the seed node
        #[arg(long)]
        addr: String,

        /// SSH user
        #[arg(long, default_value = "root")]
        user: String,

        /// SSH private key
        #[arg(long)]
        ssh_key: Option<String>,

        /// SSH port
        #[arg(long)]
        port: Option<u16>,

        /// Kubernetes version to install
        #[arg(long, default_value = "1.14.1")]
        kubernetes_version: String,

        /// Registry (and namespace) to pull images from
        #[arg(long)]
        image_repository: Option<String>,

        /// Reuse this bootstrap token instead of generating one
        #[arg(long)]
        token: Option<String>,

        /// Pod network CIDR
        #[arg(long)]
        pod_subnet: Option<String>,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Plan { file, machine } => block_on(cmd_plan(&file, machine.as_deref())),
        Commands::Apply {
            file,
            machine,
            state_dir,
        } => block_on(cmd_apply(&file, &state_dir, machine.as_deref())),
        Commands::Status {
            state_dir,
            machine,
            events,
        } => cmd_status(&state_dir, machine.as_deref(), events),
        Commands::Seed {
            addr,
            user,
            ssh_key,
            port,
            kubernetes_version,
            image_repository,
            token,
            pod_subnet,
        } => {
            let machine = Machine {
                hostname: addr.clone(),
                addr,
                user,
                ssh_key,
                port,
            };
            let params = SeedParams {
                kubernetes_version,
                image_repository,
                token,
                pod_subnet,
                ..SeedParams::for_machine(&machine)
            };
            block_on(cmd_seed(&machine, &params))
        }
    }
}

fn block_on<F: Future<Output = Result<(), String>>>(fut: F) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {}", e))?;
    runtime.block_on(fut)
}

/// Context cancelled on Ctrl-C. A cancelled run still unwinds.
fn interruptible() -> Context {
    let (ctx, handle) = Context::with_cancel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            handle.cancel();
        }
    });
    ctx
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let manifest = parser::parse_manifest_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_manifest(&manifest, &Registry::builtin());

    if errors.is_empty() {
        println!(
            "OK: {} ({} machines, {} resources)",
            manifest.name,
            manifest.machines.len(),
            manifest.resources.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

/// Parse, validate and build per-machine plans.
fn load_plans(
    file: &Path,
    machine_filter: Option<&str>,
) -> Result<(Manifest, Vec<MachinePlan>), String> {
    let manifest = parser::parse_manifest_file(file).map_err(|e| e.to_string())?;
    let plans = parser::build_plans(&manifest, &Registry::builtin(), machine_filter)
        .map_err(|e| e.to_string())?;
    Ok((manifest, plans))
}

async fn cmd_plan(file: &Path, machine_filter: Option<&str>) -> Result<(), String> {
    let (manifest, plans) = load_plans(file, machine_filter)?;
    let ctx = interruptible();
    let total: usize = plans.iter().map(|p| p.plan.len()).sum();
    println!("Planning: {} ({} resources)", manifest.name, total);
    println!();

    let (mut create, mut update, mut unchanged) = (0, 0, 0);
    for mp in &plans {
        let runner = transport::connect(&mp.machine);
        let changes = mp
            .plan
            .preview(&ctx, runner.as_ref())
            .await
            .map_err(|e| format!("{}: {}", mp.name, e))?;
        println!("{}:", mp.name);
        for change in &changes {
            let symbol = match change.action {
                PlanAction::Create => {
                    create += 1;
                    "+"
                }
                PlanAction::Update => {
                    update += 1;
                    "~"
                }
                PlanAction::NoOp => {
                    unchanged += 1;
                    " "
                }
            };
            println!("  {} {} ({})", symbol, change.resource_id, change.label);
        }
    }

    println!();
    println!(
        "Plan: {} to add, {} to change, {} unchanged.",
        create, update, unchanged
    );
    Ok(())
}

async fn cmd_apply(
    file: &Path,
    state_dir: &Path,
    machine_filter: Option<&str>,
) -> Result<(), String> {
    let (manifest, plans) = load_plans(file, machine_filter)?;
    let cfg = ApplyConfig {
        state_dir: state_dir.to_path_buf(),
        policy: manifest.policy.clone(),
    };
    let results = executor::apply_manifest(
        plans,
        &cfg,
        &interruptible(),
        executor::default_connector(),
    )
    .await;
    report_apply(&results)
}

fn report_apply(results: &[MachineResult]) -> Result<(), String> {
    let mut failed = 0;
    for r in results {
        match &r.outcome {
            Ok(result) => {
                println!(
                    "{}: {} ({} applied, {} unchanged, {:.1}s)",
                    r.machine,
                    result.outcome(),
                    result.applied.len(),
                    result.unchanged.len(),
                    r.duration.as_secs_f64()
                );
                if !result.converged {
                    failed += 1;
                    print_failure(result);
                }
            }
            Err(e) => {
                failed += 1;
                println!("{}: unreachable: {}", r.machine, e);
            }
        }
    }

    println!();
    if failed > 0 {
        return Err(format!("{} machine(s) failed", failed));
    }
    println!("Apply complete: {} machine(s) converged.", results.len());
    Ok(())
}

fn print_failure(result: &ExecutionResult) {
    if let Some(failure) = &result.error {
        println!("  FAILED: {}: {}", failure.resource_id, failure.error);
        let output = failure.error.output().trim();
        if !output.is_empty() {
            for line in output.lines() {
                println!("    | {}", line);
            }
        }
    }
    match result.outcome() {
        Outcome::RollbackIncomplete => {
            println!("  ROLLBACK INCOMPLETE: host left in an indeterminate state, inspect manually");
            for undo in &result.undo_errors {
                println!("    undo {}: {}", undo.resource_id, undo.error);
            }
        }
        Outcome::RolledBack => println!("  Rolled back {} resource(s).", result.applied.len()),
        Outcome::Converged => {}
    }
}

fn cmd_status(state_dir: &Path, machine_filter: Option<&str>, events: usize) -> Result<(), String> {
    let entries = std::fs::read_dir(state_dir)
        .map_err(|e| format!("cannot read state dir {}: {}", state_dir.display(), e))?;

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| machine_filter.is_none_or(|f| f == name))
        .collect();
    names.sort();

    let mut found = false;
    for name in &names {
        let Some(lock) = lock::load_lock(state_dir, name)? else {
            continue;
        };
        found = true;
        println!("Machine: {} ({})", lock.machine, lock.hostname);
        println!("  Generated: {}", lock.generated_at);
        println!("  Generator: {}", lock.generator);
        println!("  Outcome:   {}", lock.outcome);
        println!("  Resources: {}", lock.resources.len());

        for (id, rl) in &lock.resources {
            let duration = rl
                .duration_seconds
                .map(|d| format!(" ({:.2}s)", d))
                .unwrap_or_default();
            println!("    {}: {} [{}]{}", id, rl.status, rl.kind, duration);
        }

        if events > 0 {
            println!("  Recent events:");
            for te in eventlog::read_events(state_dir, name, events)? {
                let json = serde_json::to_string(&te.event).unwrap_or_default();
                println!("    {} {}", te.ts, json);
            }
        }
    }

    if !found {
        println!("No state found in {}", state_dir.display());
    }
    Ok(())
}

async fn cmd_seed(machine: &Machine, params: &SeedParams) -> Result<(), String> {
    let ctx = interruptible();
    let runner = transport::connect(machine);
    transport::wait_reachable(runner.as_ref(), &ctx, 5, Duration::from_secs(3))
        .await
        .map_err(|e| format!("{} unreachable: {}", machine.addr, e))?;

    let report = seed::setup_seed_node(&ctx, runner.as_ref(), params)
        .await
        .map_err(|e| format!("failed to set up seed node ({}): {}", machine.addr, e))?;

    println!("Seed node: {} ({} / {})", machine.addr, report.os.id, report.os.family);
    println!("Controller image: {}", report.controller_image);
    let result = &report.result;
    println!(
        "{} ({} applied, {} unchanged)",
        result.outcome(),
        result.applied.len(),
        result.unchanged.len()
    );
    if !result.converged {
        print_failure(result);
        return Err(format!("seed node {} did not converge", machine.addr));
    }
    match &report.token {
        Some(token) => println!("Bootstrap token: {}", token),
        None => println!("Control plane already initialized; bootstrap tokens left unchanged"),
    }
    Ok(())
}
