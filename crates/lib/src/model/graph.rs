//! Dependency graph over a set of target specs.
//!
//! Edges run from a dependency to its dependent. The graph is validated on
//! construction: ids must be unique, every dependency must name a target in
//! the set, and the relation must be acyclic.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use super::{ImageTarget, TargetId, TargetSpec};

/// Configuration errors in a target set. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
  #[error("dependency cycle detected at {0}")]
  Cycle(TargetId),

  #[error("target {target} depends on {dependency}, which is not part of the build")]
  UnknownDependency { target: TargetId, dependency: TargetId },

  #[error("duplicate target {0}")]
  DuplicateTarget(TargetId),
}

/// A validated DAG of targets.
#[derive(Debug)]
pub struct TargetGraph {
  graph: DiGraph<TargetId, ()>,
  nodes: HashMap<TargetId, NodeIndex>,
  specs: Vec<TargetSpec>,
}

impl TargetGraph {
  pub fn new(specs: &[TargetSpec]) -> Result<Self, GraphError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for spec in specs {
      let id = spec.id();
      if nodes.contains_key(&id) {
        return Err(GraphError::DuplicateTarget(id));
      }
      let idx = graph.add_node(id.clone());
      nodes.insert(id, idx);
    }

    for spec in specs {
      let dependent = nodes[&spec.id()];
      for dep in spec.dependency_ids() {
        let Some(&dep_idx) = nodes.get(dep) else {
          return Err(GraphError::UnknownDependency {
            target: spec.id(),
            dependency: dep.clone(),
          });
        };
        graph.add_edge(dep_idx, dependent, ());
      }
    }

    toposort(&graph, None).map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].clone()))?;

    Ok(Self {
      graph,
      nodes,
      specs: specs.to_vec(),
    })
  }

  pub fn spec(&self, id: &TargetId) -> Option<&TargetSpec> {
    self.specs.iter().find(|s| &s.id() == id)
  }

  /// Targets in an order where every dependency precedes its dependents.
  ///
  /// Deterministic: roots are visited in declared order and each target's
  /// dependencies in their declared order.
  pub fn topological_order(&self) -> Vec<TargetSpec> {
    let mut visited = HashSet::new();
    let mut sorted = Vec::with_capacity(self.specs.len());
    for spec in &self.specs {
      self.visit_post_order(spec, &mut visited, &mut sorted);
    }
    sorted
  }

  fn visit_post_order(&self, spec: &TargetSpec, visited: &mut HashSet<TargetId>, sorted: &mut Vec<TargetSpec>) {
    if !visited.insert(spec.id()) {
      return;
    }
    for dep in spec.dependency_ids() {
      if let Some(dep_spec) = self.spec(dep) {
        self.visit_post_order(dep_spec, visited, sorted);
      }
    }
    sorted.push(spec.clone());
  }

  /// True when exactly one target has no dependents.
  pub fn is_single_source_dag(&self) -> bool {
    self
      .graph
      .node_indices()
      .filter(|&idx| self.graph.neighbors_directed(idx, Direction::Outgoing).next().is_none())
      .count()
      == 1
  }

  /// Image targets that a deploy target depends on directly.
  ///
  /// Images only injected into other images are never deployed, so they are
  /// not live-update candidates on their own.
  pub fn deployed_images(&self) -> Vec<ImageTarget> {
    let mut deployed = Vec::new();
    for spec in self.specs.iter().filter(|s| s.is_deploy()) {
      for dep in spec.dependency_ids() {
        if let Some(TargetSpec::Image(image)) = self.spec(dep)
          && !deployed.contains(image)
        {
          deployed.push(image.clone());
        }
      }
    }
    deployed
  }

  /// The target and all of its transitive dependencies, each exactly once,
  /// target first.
  pub fn tree(&self, id: &TargetId) -> Vec<&TargetSpec> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut stack = vec![id.clone()];
    while let Some(current) = stack.pop() {
      if !seen.insert(current.clone()) {
        continue;
      }
      if let Some(spec) = self.spec(&current) {
        out.push(spec);
        for dep in spec.dependency_ids().iter().rev() {
          stack.push(dep.clone());
        }
      }
    }
    out
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }
}

/// Sort specs so dependencies come before dependents.
///
/// Fails with a [`GraphError`] when the set is not a valid DAG.
pub fn topological_sort(specs: &[TargetSpec]) -> Result<Vec<TargetSpec>, GraphError> {
  Ok(TargetGraph::new(specs)?.topological_order())
}
