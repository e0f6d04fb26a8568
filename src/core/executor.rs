//! NR-034: Plan execution with reverse-order unwind, and the
//! multi-machine apply loop.
//!
//! Per machine: connect → wait for reachability → execute plan → lock → events.
//! Per resource: query → diff → skip or apply. The first failure stops the
//! plan and unwinds every resource applied in this run, last first.

use super::graph::{Node, Plan};
use super::instrument::{EventSink, NullSink, Probe};
use super::lock;
use super::parser::MachinePlan;
use super::state::State;
use super::types::{Machine, Policy, ProvenanceEvent, ResourceStatus};
use crate::error::{ResourceError, RunError};
use crate::provenance::eventlog::{self, JsonlSink};
use crate::resources::Converge;
use crate::transport::{self, Context, Runner};
use indexmap::IndexMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn, Instrument};

/// Options for one plan execution.
#[derive(Clone)]
pub struct ExecuteOptions {
    /// Budget for the whole unwind after a failure.
    pub undo_timeout: Duration,
    pub sink: Arc<dyn EventSink>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            undo_timeout: Duration::from_secs(600),
            sink: Arc::new(NullSink),
        }
    }
}

impl ExecuteOptions {
    pub fn with_undo_timeout(mut self, timeout: Duration) -> Self {
        self.undo_timeout = timeout;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }
}

/// How a plan execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every resource is converged.
    Converged,
    /// A resource failed and every applied resource was undone.
    RolledBack,
    /// A resource failed and at least one undo failed too. The host is in an
    /// indeterminate state.
    RollbackIncomplete,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::RollbackIncomplete => write!(f, "rollback_incomplete"),
        }
    }
}

/// A resource error tied to the resource id that produced it.
#[derive(Debug, Clone)]
pub struct Failure {
    pub resource_id: String,
    pub error: ResourceError,
}

/// Aggregated report of one plan execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// True when no resource failed.
    pub converged: bool,
    /// Ids applied in this run, in apply order.
    pub applied: Vec<String>,
    /// Ids found already converged.
    pub unchanged: Vec<String>,
    /// The failure that stopped the plan.
    pub error: Option<Failure>,
    pub undo_errors: Vec<Failure>,
    /// Final status per resource, in plan order.
    pub statuses: IndexMap<String, ResourceStatus>,
    /// Apply durations in seconds.
    pub durations: IndexMap<String, f64>,
}

impl ExecutionResult {
    fn new(plan: &Plan) -> Self {
        Self {
            statuses: plan
                .nodes()
                .iter()
                .map(|n| (n.id.clone(), ResourceStatus::Unqueried))
                .collect(),
            ..Self::default()
        }
    }

    pub fn outcome(&self) -> Outcome {
        match (&self.error, self.undo_errors.is_empty()) {
            (None, _) => Outcome::Converged,
            (Some(_), true) => Outcome::RolledBack,
            (Some(_), false) => Outcome::RollbackIncomplete,
        }
    }

    pub fn status(&self, id: &str) -> ResourceStatus {
        self.statuses
            .get(id)
            .copied()
            .unwrap_or(ResourceStatus::Unqueried)
    }

    fn mark(&mut self, id: &str, status: ResourceStatus) {
        if let Some(slot) = self.statuses.get_mut(id) {
            *slot = status;
        }
    }

    fn fail(&mut self, id: &str, error: ResourceError) {
        self.mark(id, ResourceStatus::Failed);
        self.error = Some(Failure {
            resource_id: id.to_string(),
            error,
        });
    }
}

impl Plan {
    /// Converge every resource in order. Never returns early with an error:
    /// failures, including cancellation, end up in the result after the
    /// unwind has run.
    pub async fn execute(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        opts: &ExecuteOptions,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::new(self);
        let mut applied: Vec<(&Node, State)> = Vec::new();

        for node in self.nodes() {
            let probe = Probe::new(&node.id, &node.resource, self.name(), &opts.sink);
            let diff = match probe.observe(ctx, runner).await {
                Ok(diff) => diff,
                Err(e) => {
                    result.fail(&node.id, e);
                    break;
                }
            };
            result.mark(&node.id, ResourceStatus::Queried);

            if !node.resource.is_different(diff.current()) {
                probe.unchanged();
                result.mark(&node.id, ResourceStatus::Unchanged);
                result.unchanged.push(node.id.clone());
                continue;
            }

            result.mark(&node.id, ResourceStatus::Applying);
            let started = Instant::now();
            match probe.apply(ctx, runner, &diff).await {
                Ok(true) => {
                    result.mark(&node.id, ResourceStatus::Applied);
                    result.applied.push(node.id.clone());
                    result
                        .durations
                        .insert(node.id.clone(), started.elapsed().as_secs_f64());
                    applied.push((node, diff.current().clone()));
                }
                Ok(false) => {
                    result.mark(&node.id, ResourceStatus::Unchanged);
                    result.unchanged.push(node.id.clone());
                }
                Err(e) => {
                    result.fail(&node.id, e);
                    break;
                }
            }
        }

        if let Some(failure) = &result.error {
            warn!(
                plan = self.name(),
                resource = %failure.resource_id,
                error = %failure.error,
                to_undo = applied.len(),
                "plan failed, unwinding"
            );
        }
        if result.error.is_some() {
            let unwind = ctx.detached(opts.undo_timeout);
            for (node, prior) in applied.iter().rev() {
                result.mark(&node.id, ResourceStatus::Undoing);
                let probe = Probe::new(&node.id, &node.resource, self.name(), &opts.sink);
                match probe.undo(&unwind, runner, prior).await {
                    Ok(()) => result.mark(&node.id, ResourceStatus::Undone),
                    Err(e) => {
                        result.mark(&node.id, ResourceStatus::UndoFailed);
                        result.undo_errors.push(Failure {
                            resource_id: node.id.clone(),
                            error: e,
                        });
                    }
                }
            }
        }

        result.converged = result.error.is_none();
        result
    }
}

// ============================================================================
// Multi-machine apply
// ============================================================================

/// Opens the runner for a machine.
pub type Connector = Arc<dyn Fn(&Machine) -> Arc<dyn Runner> + Send + Sync>;

/// Local runner for loopback addresses, SSH otherwise.
pub fn default_connector() -> Connector {
    Arc::new(|machine: &Machine| -> Arc<dyn Runner> { Arc::from(transport::connect(machine)) })
}

/// Configuration for an apply run.
#[derive(Debug, Clone)]
pub struct ApplyConfig {
    pub state_dir: PathBuf,
    pub policy: Policy,
}

/// Result of converging one machine.
#[derive(Debug)]
pub struct MachineResult {
    pub machine: String,
    pub run_id: String,
    /// `Err` when the host never became reachable.
    pub outcome: Result<ExecutionResult, RunError>,
    pub duration: Duration,
}

impl MachineResult {
    /// True when the machine converged.
    pub fn is_success(&self) -> bool {
        self.outcome.as_ref().is_ok_and(|r| r.converged)
    }
}

/// Converge every machine plan. Failures stay local to their machine; the
/// results come back in the order of `plans`.
pub async fn apply_manifest(
    plans: Vec<MachinePlan>,
    cfg: &ApplyConfig,
    ctx: &Context,
    connect: Connector,
) -> Vec<MachineResult> {
    if !cfg.policy.parallel_machines {
        let mut results = Vec::with_capacity(plans.len());
        for mp in &plans {
            results.push(converge_machine(mp, cfg, ctx, &connect).await);
        }
        return results;
    }

    let mut handles = Vec::with_capacity(plans.len());
    for mp in plans {
        let cfg = cfg.clone();
        let ctx = ctx.clone();
        let connect = connect.clone();
        let name = mp.name.clone();
        let handle =
            tokio::spawn(async move { converge_machine(&mp, &cfg, &ctx, &connect).await });
        handles.push((name, handle));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (name, handle) in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                error!(machine = %name, error = %e, "machine task failed");
                results.push(MachineResult {
                    machine: name,
                    run_id: String::new(),
                    outcome: Err(RunError::Transport(format!("machine task failed: {}", e))),
                    duration: Duration::ZERO,
                });
            }
        }
    }
    results
}

async fn converge_machine(
    mp: &MachinePlan,
    cfg: &ApplyConfig,
    ctx: &Context,
    connect: &Connector,
) -> MachineResult {
    let run_id = eventlog::generate_run_id();
    let span = info_span!("machine", machine = %mp.name, run_id = %run_id);
    async {
        let started = Instant::now();
        let sink: Arc<dyn EventSink> = if cfg.policy.event_log {
            Arc::new(JsonlSink::new(&cfg.state_dir, &mp.name))
        } else {
            Arc::new(NullSink)
        };
        sink.emit(ProvenanceEvent::ApplyStarted {
            machine: mp.name.clone(),
            run_id: run_id.clone(),
            noderig_version: env!("CARGO_PKG_VERSION").to_string(),
        });

        let runner = connect(&mp.machine);
        let ctx = ctx.with_timeout(Duration::from_secs(cfg.policy.plan_timeout_secs));
        let reach = &cfg.policy.reachability;

        let outcome = match transport::wait_reachable(
            runner.as_ref(),
            &ctx,
            reach.attempts,
            Duration::from_secs(reach.delay_secs),
        )
        .await
        {
            Ok(()) => {
                let opts = ExecuteOptions::default()
                    .with_undo_timeout(Duration::from_secs(cfg.policy.undo_timeout_secs))
                    .with_sink(sink.clone());
                let result = mp.plan.execute(&ctx, runner.as_ref(), &opts).await;
                if cfg.policy.lock_file {
                    write_lock(cfg, mp, &result);
                }
                Ok(result)
            }
            Err(e) => {
                error!(target_host = runner.target(), error = %e, "host unreachable");
                Err(e)
            }
        };

        let duration = started.elapsed();
        let (label, applied, unchanged) = match &outcome {
            Ok(r) => (r.outcome().to_string(), r.applied.len(), r.unchanged.len()),
            Err(_) => ("unreachable".to_string(), 0, 0),
        };
        info!(outcome = %label, applied, unchanged, "machine done");
        sink.emit(ProvenanceEvent::ApplyCompleted {
            machine: mp.name.clone(),
            run_id: run_id.clone(),
            outcome: label,
            resources_applied: applied as u32,
            resources_unchanged: unchanged as u32,
            total_seconds: duration.as_secs_f64(),
        });

        MachineResult {
            machine: mp.name.clone(),
            run_id: run_id.clone(),
            outcome,
            duration,
        }
    }
    .instrument(span)
    .await
}

fn write_lock(cfg: &ApplyConfig, mp: &MachinePlan, result: &ExecutionResult) {
    let previous = match lock::load_lock(&cfg.state_dir, &mp.name) {
        Ok(prev) => prev,
        Err(e) => {
            warn!(error = %e, "ignoring unreadable lock");
            None
        }
    };
    let lock = lock::lock_from_execution(
        &mp.name,
        &mp.machine.hostname,
        &mp.plan,
        result,
        previous.as_ref(),
    );
    if let Err(e) = lock::save_lock(&cfg.state_dir, &lock) {
        warn!(error = %e, "lock write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instrument::MemorySink;
    use crate::core::parser::{build_plans, parse_manifest};
    use crate::core::registry::Registry;
    use crate::core::types::Reachability;
    use crate::resources::{Resource, RunCommand};
    use crate::transport::fake::FakeRunner;
    use crate::transport::local::LocalRunner;
    use crate::transport::shell_quote;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn step(n: u32) -> (String, Resource) {
        (
            format!("s{}", n),
            Resource::Command(
                RunCommand::new(&format!("step{}", n))
                    .unwrap()
                    .with_undo(&format!("undo{}", n)),
            ),
        )
    }

    fn three_steps() -> Plan {
        Plan::build("m0", vec![step(1), step(2), step(3)], &[]).unwrap()
    }

    fn opts() -> ExecuteOptions {
        ExecuteOptions::default()
    }

    #[tokio::test]
    async fn test_nr034_unwind_reverse_order() {
        let runner = FakeRunner::new();
        runner.fail("step3", 1, "boom");
        let result = three_steps()
            .execute(&Context::background(), &runner, &opts())
            .await;

        assert_eq!(
            runner.commands(),
            vec!["step1", "step2", "step3", "undo2", "undo1"]
        );
        assert!(!result.converged);
        assert_eq!(result.outcome(), Outcome::RolledBack);
        assert_eq!(result.error.as_ref().unwrap().resource_id, "s3");
        assert_eq!(result.error.as_ref().unwrap().error.output(), "boom");
        assert_eq!(result.status("s1"), ResourceStatus::Undone);
        assert_eq!(result.status("s2"), ResourceStatus::Undone);
        assert_eq!(result.status("s3"), ResourceStatus::Failed);
    }

    #[tokio::test]
    async fn test_nr034_failure_stops_advancing() {
        let runner = FakeRunner::new();
        runner.fail("step1", 1, "no");
        let result = three_steps()
            .execute(&Context::background(), &runner, &opts())
            .await;
        assert_eq!(runner.commands(), vec!["step1"]);
        assert_eq!(result.status("s2"), ResourceStatus::Unqueried);
        assert_eq!(result.outcome(), Outcome::RolledBack);
    }

    #[tokio::test]
    async fn test_nr034_undo_failure_is_incomplete() {
        let runner = FakeRunner::new();
        runner.fail("step3", 1, "boom");
        runner.fail("undo2", 1, "stuck");
        let result = three_steps()
            .execute(&Context::background(), &runner, &opts())
            .await;

        // undo1 still runs after undo2 failed
        assert_eq!(runner.commands().last().unwrap(), "undo1");
        assert_eq!(result.outcome(), Outcome::RollbackIncomplete);
        assert_eq!(result.undo_errors.len(), 1);
        assert_eq!(result.undo_errors[0].resource_id, "s2");
        assert_eq!(result.status("s2"), ResourceStatus::UndoFailed);
        assert_eq!(result.status("s1"), ResourceStatus::Undone);
    }

    #[tokio::test]
    async fn test_nr034_dependency_order_respected() {
        let plan = Plan::build(
            "m0",
            vec![step(2), step(1)],
            &[("s1".to_string(), "s2".to_string())],
        )
        .unwrap();
        let runner = FakeRunner::new();
        let result = plan.execute(&Context::background(), &runner, &opts()).await;
        assert_eq!(runner.commands(), vec!["step1", "step2"]);
        assert_eq!(result.applied, vec!["s1", "s2"]);
        assert_eq!(result.outcome(), Outcome::Converged);
    }

    /// Host whose `make-x` commands create marker `x` checked by `check-x`.
    fn marker_host() -> (FakeRunner, Arc<Mutex<HashSet<String>>>) {
        let markers = Arc::new(Mutex::new(HashSet::new()));
        let host = markers.clone();
        let runner = FakeRunner::with_handler(move |cmd| {
            let mut set = host.lock().unwrap();
            if let Some(m) = cmd.strip_prefix("check-") {
                return Some(if set.contains(m) {
                    Ok(String::new())
                } else {
                    Err(RunError::Exit {
                        exit_code: 1,
                        output: String::new(),
                    })
                });
            }
            if let Some(m) = cmd.strip_prefix("make-") {
                set.insert(m.to_string());
                return Some(Ok(String::new()));
            }
            None
        });
        (runner, markers)
    }

    fn guarded(id: &str) -> (String, Resource) {
        (
            id.to_string(),
            Resource::Command(
                RunCommand::new(&format!("make-{}", id))
                    .unwrap()
                    .unless(&format!("check-{}", id)),
            ),
        )
    }

    #[tokio::test]
    async fn test_nr034_rerun_after_partial_success() {
        let (runner, markers) = marker_host();
        let plan = Plan::build(
            "m0",
            vec![guarded("a"), guarded("b")],
            &[("a".to_string(), "b".to_string())],
        )
        .unwrap();
        let ctx = Context::background();

        runner.fail_next("make-b", 1, "transient");
        let first = plan.execute(&ctx, &runner, &opts()).await;
        assert_eq!(first.outcome(), Outcome::RolledBack);
        // `a` has no undo command, so its marker survives the unwind
        assert!(markers.lock().unwrap().contains("a"));

        let second = plan.execute(&ctx, &runner, &opts()).await;
        assert_eq!(second.outcome(), Outcome::Converged);
        assert_eq!(second.unchanged, vec!["a"]);
        assert_eq!(second.applied, vec!["b"]);

        let third = plan.execute(&ctx, &runner, &opts()).await;
        assert!(third.applied.is_empty());
        assert_eq!(third.unchanged.len(), 2);
    }

    #[tokio::test]
    async fn test_nr034_events_emitted() {
        let memory = Arc::new(MemorySink::new());
        let runner = FakeRunner::new();
        runner.fail("step2", 1, "boom");
        let plan = Plan::build("m0", vec![step(1), step(2)], &[]).unwrap();
        plan.execute(
            &Context::background(),
            &runner,
            &opts().with_sink(memory.clone()),
        )
        .await;

        let kinds: Vec<&str> = memory
            .events()
            .iter()
            .map(|e| match e {
                ProvenanceEvent::ResourceConverged { .. } => "converged",
                ProvenanceEvent::ResourceFailed { .. } => "failed",
                ProvenanceEvent::ResourceUndone { .. } => "undone",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["converged", "failed", "undone"]);
    }

    #[tokio::test]
    async fn test_nr034_timeout_kills_command_and_unwinds() {
        let dir = tempfile::tempdir().unwrap();
        let marker = shell_quote(&dir.path().join("a").display().to_string());
        let first = Resource::Command(
            RunCommand::new(&format!("touch {}", marker))
                .unwrap()
                .with_undo(&format!("rm -f {}", marker)),
        );
        let slow = Resource::Command(RunCommand::new("sleep 30").unwrap());
        let plan = Plan::build(
            "local",
            vec![("a".to_string(), first), ("slow".to_string(), slow)],
            &[],
        )
        .unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(300));
        let started = Instant::now();
        let result = plan.execute(&ctx, &LocalRunner::new(), &opts()).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        let failure = result.error.as_ref().unwrap();
        assert_eq!(failure.resource_id, "slow");
        assert!(failure.error.is_cancellation());
        assert_eq!(result.status("a"), ResourceStatus::Undone);
        assert!(!dir.path().join("a").exists());
        assert_eq!(result.outcome(), Outcome::RolledBack);
    }

    #[tokio::test]
    async fn test_nr034_cancelled_before_start() {
        let (ctx, handle) = Context::with_cancel();
        handle.cancel();
        let runner = FakeRunner::new();
        let result = three_steps().execute(&ctx, &runner, &opts()).await;
        assert!(runner.commands().is_empty());
        assert!(result.error.unwrap().error.is_cancellation());
    }

    // ------------------------------------------------------------------------
    // apply_manifest
    // ------------------------------------------------------------------------

    const MANIFEST: &str = r#"
version: "1.0"
name: lab
machines:
  alpha: { hostname: a, addr: 10.0.0.1 }
  beta: { hostname: b, addr: 10.0.0.2 }
resources:
  prep:
    type: command
    machine: [alpha, beta]
    run: prep-host
  join:
    type: command
    machine: beta
    run: join-beta
    undo: leave-beta
    depends_on: [prep]
"#;

    fn config(dir: &std::path::Path, parallel: bool) -> ApplyConfig {
        let policy = Policy {
            parallel_machines: parallel,
            reachability: Reachability {
                attempts: 2,
                delay_secs: 0,
            },
            ..Policy::default()
        };
        ApplyConfig {
            state_dir: dir.to_path_buf(),
            policy,
        }
    }

    fn plans() -> Vec<MachinePlan> {
        let manifest = parse_manifest(MANIFEST).unwrap();
        build_plans(&manifest, &Registry::builtin(), None).unwrap()
    }

    fn connector(runner: Arc<FakeRunner>) -> Connector {
        Arc::new(move |_m: &Machine| -> Arc<dyn Runner> { runner.clone() })
    }

    #[tokio::test]
    async fn test_nr034_apply_manifest_writes_lock_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let results = apply_manifest(
            plans(),
            &config(dir.path(), false),
            &Context::background(),
            connector(runner.clone()),
        )
        .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_success()));

        let lock = lock::load_lock(dir.path(), "beta").unwrap().unwrap();
        assert_eq!(lock.outcome, "converged");
        assert_eq!(lock.hostname, "b");
        assert_eq!(lock.resources["join"].status, ResourceStatus::Applied);
        assert!(lock.resources["join"].hash.starts_with("blake3:"));

        let events = eventlog::read_events(dir.path(), "alpha", 100).unwrap();
        assert!(matches!(
            events.first().unwrap().event,
            ProvenanceEvent::ApplyStarted { .. }
        ));
        match &events.last().unwrap().event {
            ProvenanceEvent::ApplyCompleted {
                outcome,
                resources_applied,
                ..
            } => {
                assert_eq!(outcome, "converged");
                assert_eq!(*resources_applied, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nr034_parallel_failure_stays_local() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.fail("join-beta", 1, "token expired");
        let results = apply_manifest(
            plans(),
            &config(dir.path(), true),
            &Context::background(),
            connector(runner.clone()),
        )
        .await;

        assert_eq!(results[0].machine, "alpha");
        assert!(results[0].is_success());
        assert_eq!(results[1].machine, "beta");
        let beta = results[1].outcome.as_ref().unwrap();
        assert_eq!(beta.outcome(), Outcome::RolledBack);
        assert_eq!(beta.status("prep"), ResourceStatus::Undone);

        let lock = lock::load_lock(dir.path(), "beta").unwrap().unwrap();
        assert_eq!(lock.outcome, "rolled_back");
        assert_eq!(lock.resources["join"].status, ResourceStatus::Failed);
    }

    #[tokio::test]
    async fn test_nr034_unreachable_machine() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        runner.fail("true", 255, "ssh: connect to host 10.0.0.1: Connection refused");
        let mut cfg = config(dir.path(), false);
        cfg.policy.lock_file = false;
        let results = apply_manifest(
            plans(),
            &cfg,
            &Context::background(),
            connector(runner.clone()),
        )
        .await;

        assert!(results.iter().all(|r| r.outcome.is_err()));
        // two probes per machine, no resource command
        assert_eq!(runner.commands().len(), 4);
        assert!(lock::load_lock(dir.path(), "alpha").unwrap().is_none());
        let events = eventlog::read_events(dir.path(), "alpha", 10).unwrap();
        assert!(matches!(
            &events[1].event,
            ProvenanceEvent::ApplyCompleted { outcome, .. } if outcome == "unreachable"
        ));
    }

    #[tokio::test]
    async fn test_nr034_event_log_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), false);
        cfg.policy.event_log = false;
        apply_manifest(
            plans(),
            &cfg,
            &Context::background(),
            connector(Arc::new(FakeRunner::new())),
        )
        .await;
        assert!(!eventlog::event_log_path(dir.path(), "alpha").exists());
        assert!(lock::lock_file_path(dir.path(), "alpha").exists());
    }
}
