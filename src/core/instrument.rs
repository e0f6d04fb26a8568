//! NR-033: Instrumentation around every resource capability call.
//!
//! The engine never calls `query_state`, `apply` or `undo` directly; it goes
//! through [`Probe`], which opens a `tracing` span per call and reports the
//! outcome to an [`EventSink`].

use crate::core::state::{Diff, State};
use crate::core::types::ProvenanceEvent;
use crate::error::ResourceError;
use crate::provenance::hasher;
use crate::resources::{Converge, Resource};
use crate::transport::{Context, Runner};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Receives provenance events as the engine produces them.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProvenanceEvent);
}

/// Discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ProvenanceEvent) {}
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<ProvenanceEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProvenanceEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: ProvenanceEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}

/// One resource wrapped for instrumented calls.
pub struct Probe<'a> {
    id: &'a str,
    resource: &'a Resource,
    machine: &'a str,
    sink: &'a Arc<dyn EventSink>,
}

impl<'a> Probe<'a> {
    pub fn new(
        id: &'a str,
        resource: &'a Resource,
        machine: &'a str,
        sink: &'a Arc<dyn EventSink>,
    ) -> Self {
        Self {
            id,
            resource,
            machine,
            sink,
        }
    }

    fn failed(&self, err: &ResourceError) {
        self.sink.emit(ProvenanceEvent::ResourceFailed {
            machine: self.machine.to_string(),
            resource: self.id.to_string(),
            error: err.to_string(),
            output: err.output().to_string(),
        });
    }

    /// Live query paired with the desired state.
    pub async fn observe(&self, ctx: &Context, runner: &dyn Runner) -> Result<Diff, ResourceError> {
        let span = info_span!(
            "query_state",
            resource = self.id,
            kind = %self.resource.kind(),
            label = %self.resource.label()
        );
        async {
            let result = Diff::observe(self.resource, ctx, runner).await;
            match &result {
                Ok(diff) => debug!(current = %diff.current(), "observed"),
                Err(e) => {
                    warn!(error = %e, "query failed");
                    self.failed(e);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Record that the resource needed no change.
    pub fn unchanged(&self) {
        info!(resource = self.id, label = %self.resource.label(), "unchanged");
        self.sink.emit(ProvenanceEvent::ResourceUnchanged {
            machine: self.machine.to_string(),
            resource: self.id.to_string(),
        });
    }

    pub async fn apply(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        diff: &Diff,
    ) -> Result<bool, ResourceError> {
        let span = info_span!(
            "apply",
            resource = self.id,
            kind = %self.resource.kind(),
            label = %self.resource.label()
        );
        async {
            let started = Instant::now();
            let result = self.resource.apply(ctx, runner, diff).await;
            let duration = started.elapsed().as_secs_f64();
            match &result {
                Ok(true) => {
                    info!(duration_seconds = duration, "converged");
                    self.sink.emit(ProvenanceEvent::ResourceConverged {
                        machine: self.machine.to_string(),
                        resource: self.id.to_string(),
                        duration_seconds: duration,
                        hash: hasher::hash_desired(self.resource),
                    });
                }
                Ok(false) => self.unchanged(),
                Err(e) => {
                    error!(error = %e, "apply failed");
                    self.failed(e);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    pub async fn undo(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
        prior: &State,
    ) -> Result<(), ResourceError> {
        let span = info_span!(
            "undo",
            resource = self.id,
            kind = %self.resource.kind(),
            label = %self.resource.label()
        );
        async {
            let result = self.resource.undo(ctx, runner, prior).await;
            match &result {
                Ok(()) => {
                    info!("undone");
                    self.sink.emit(ProvenanceEvent::ResourceUndone {
                        machine: self.machine.to_string(),
                        resource: self.id.to_string(),
                    });
                }
                Err(e) => {
                    error!(error = %e, "undo failed");
                    self.sink.emit(ProvenanceEvent::UndoFailed {
                        machine: self.machine.to_string(),
                        resource: self.id.to_string(),
                        error: e.to_string(),
                    });
                }
            }
            result
        }
        .instrument(span)
        .await
    }
}
