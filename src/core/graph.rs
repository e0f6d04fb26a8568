//! NR-031: Plan construction and dry-run preview.
//!
//! A Plan is a set of `(id, Resource)` plus dependency edges, stored in
//! topological order. Order is computed with Kahn's algorithm; among ready
//! nodes the earliest submitted goes first, so independent resources keep
//! manifest order.

use super::instrument::{EventSink, NullSink, Probe};
use super::types::{PlanAction, PlannedChange};
use crate::error::{ConstructionError, ResourceError};
use crate::resources::{Converge, Resource};
use crate::transport::{Context, Runner};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// One resource and the ids it waits for.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub resource: Resource,
    pub depends_on: Vec<String>,
}

/// Dependency edge `(before, after)`: `after` depends on `before`.
pub type Edge = (String, String);

/// Nodes Kahn's algorithm left behind, minus those that only hang off a
/// cycle downstream: peel every blocked node with no blocked successor.
fn cycle_members(adjacency: &[Vec<usize>], in_degree: &[usize]) -> Vec<usize> {
    let n = adjacency.len();
    let mut blocked: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
    let mut out_degree = vec![0usize; n];
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for from in (0..n).filter(|&i| blocked[i]) {
        for &to in adjacency[from].iter().filter(|&&to| blocked[to]) {
            out_degree[from] += 1;
            predecessors[to].push(from);
        }
    }

    let mut sinks: Vec<usize> = (0..n).filter(|&i| blocked[i] && out_degree[i] == 0).collect();
    while let Some(sink) = sinks.pop() {
        blocked[sink] = false;
        for &pred in &predecessors[sink] {
            out_degree[pred] -= 1;
            if out_degree[pred] == 0 && blocked[pred] {
                sinks.push(pred);
            }
        }
    }
    (0..n).filter(|&i| blocked[i]).collect()
}

/// Dependency-ordered collection of resources executed as one unit.
#[derive(Debug, Clone)]
pub struct Plan {
    name: String,
    nodes: Vec<Node>,
}

impl Plan {
    /// Validate ids and edges and compute the execution order.
    pub fn build(
        name: &str,
        resources: Vec<(String, Resource)>,
        edges: &[Edge],
    ) -> Result<Self, ConstructionError> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, (id, _)) in resources.iter().enumerate() {
            if index.insert(id.as_str(), i).is_some() {
                return Err(ConstructionError::DuplicateId(id.clone()));
            }
        }

        let n = resources.len();
        let mut in_degree = vec![0usize; n];
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut depends_on: Vec<Vec<String>> = vec![Vec::new(); n];

        for (before, after) in edges {
            if before == after {
                return Err(ConstructionError::SelfDependency(after.clone()));
            }
            let lookup = |id: &String| {
                index
                    .get(id.as_str())
                    .copied()
                    .ok_or_else(|| ConstructionError::UnknownDependency {
                        from: before.clone(),
                        to: after.clone(),
                        missing: id.clone(),
                    })
            };
            let b = lookup(before)?;
            let a = lookup(after)?;
            if adjacency[b].contains(&a) {
                continue;
            }
            adjacency[b].push(a);
            in_degree[a] += 1;
            depends_on[a].push(before.clone());
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(current) = ready.pop_first() {
            order.push(current);
            for &next in &adjacency[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != n {
            let members = cycle_members(&adjacency, &in_degree)
                .into_iter()
                .map(|i| resources[i].0.clone())
                .collect();
            return Err(ConstructionError::Cycle(members));
        }

        let mut slots: Vec<Option<(String, Resource)>> = resources.into_iter().map(Some).collect();
        let mut nodes = Vec::with_capacity(n);
        for i in order {
            if let Some((id, resource)) = slots[i].take() {
                nodes.push(Node {
                    id,
                    resource,
                    depends_on: std::mem::take(&mut depends_on[i]),
                });
            }
        }

        Ok(Self {
            name: name.to_string(),
            nodes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nodes in execution order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Resource ids in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dry run: query every resource and predict its action. Never mutates.
    ///
    /// Each resource is judged against the host as it is now, so a resource
    /// whose prerequisite is itself pending may be predicted as CREATE even
    /// though the prerequisite's apply would change the picture.
    pub async fn preview(
        &self,
        ctx: &Context,
        runner: &dyn Runner,
    ) -> Result<Vec<PlannedChange>, ResourceError> {
        let sink: Arc<dyn EventSink> = Arc::new(NullSink);
        let mut changes = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let probe = Probe::new(&node.id, &node.resource, &self.name, &sink);
            let diff = probe.observe(ctx, runner).await?;
            let action = if diff.current().is_empty() {
                PlanAction::Create
            } else if node.resource.is_different(diff.current()) {
                PlanAction::Update
            } else {
                PlanAction::NoOp
            };
            changes.push(PlannedChange {
                resource_id: node.id.clone(),
                label: node.resource.label(),
                action,
            });
        }
        Ok(changes)
    }
}
