//! Dependency-ordered execution of one manifest's targets.
//!
//! On construction the queue decides, for every target, whether it must be
//! built and whether any of its dependencies must be. [`TargetQueue::run_builds`]
//! then walks the targets in topological order:
//!
//! - a target with a dirty dependency is built from an empty state
//! - a target that is dirty itself is built from its real state, so the
//!   handler can build incrementally from the changed files
//! - anything else reuses its last result without calling the handler

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::errors::{BuildError, CollaboratorError, TargetFailure};
use crate::model::{GraphError, TargetId, TargetSpec, topological_sort};
use crate::store::{BuildResult, BuildResultSet, BuildState, BuildStateSet};

#[derive(Debug, Error)]
pub enum QueueError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("checking whether image {image_ref} for {target} exists")]
  ImageCheck {
    target: TargetId,
    image_ref: String,
    #[source]
    source: CollaboratorError,
  },

  #[error("internal error: {target} was scheduled for reuse without a previous result")]
  Internal { target: TargetId },
}

/// Asks the container runtime whether an image is still present.
#[async_trait]
pub trait ImageChecker: Send + Sync {
  async fn image_exists(&self, image_ref: &str) -> Result<bool, CollaboratorError>;
}

/// Builds a single target. Supplied by the image, deploy and local-exec
/// collaborators.
#[async_trait]
pub trait TargetBuilder: Send + Sync {
  async fn build(
    &self,
    spec: &TargetSpec,
    state: &BuildState,
    dependency_results: &[BuildResult],
  ) -> Result<BuildResult, BuildError>;
}

#[derive(Debug)]
pub struct TargetQueue {
  sorted: Vec<TargetSpec>,
  state: BuildStateSet,
  needs_own_build: BTreeSet<TargetId>,
  deps_need_build: BTreeSet<TargetId>,

  results: BuildResultSet,
  reused: BuildResultSet,
  failed: Vec<TargetFailure>,
  /// Target -> the failed or skipped dependency that kept it from building.
  skipped: BTreeMap<TargetId, TargetId>,
}

impl TargetQueue {
  pub async fn new(specs: &[TargetSpec], state: BuildStateSet, checker: &dyn ImageChecker) -> Result<Self, QueueError> {
    let sorted = topological_sort(specs)?;

    let mut needs_own_build = BTreeSet::new();
    let mut deps_need_build = BTreeSet::new();
    let mut reused = BuildResultSet::new();

    for spec in &sorted {
      let id = spec.id();
      let target_state = state.get(&id);

      if target_state.is_none_or(BuildState::needs_build) || !artifact_exists(&id, target_state, checker).await? {
        needs_own_build.insert(id.clone());
      }

      let dirty_dep = spec
        .dependency_ids()
        .iter()
        .any(|dep| needs_own_build.contains(dep) || deps_need_build.contains(dep));
      if dirty_dep {
        deps_need_build.insert(id.clone());
      }

      if !needs_own_build.contains(&id) && !deps_need_build.contains(&id) {
        let result = target_state
          .and_then(|s| s.last_result.clone())
          .ok_or_else(|| QueueError::Internal { target: id.clone() })?;
        reused.insert(id, result);
      }
    }

    debug!(
      targets = sorted.len(),
      to_build = sorted.len() - reused.len(),
      reused = reused.len(),
      "target queue ready"
    );

    Ok(Self {
      sorted,
      state,
      needs_own_build,
      deps_need_build,
      results: BuildResultSet::new(),
      reused,
      failed: Vec::new(),
      skipped: BTreeMap::new(),
    })
  }

  pub fn needs_own_build(&self, id: &TargetId) -> bool {
    self.needs_own_build.contains(id)
  }

  pub fn deps_need_build(&self, id: &TargetId) -> bool {
    self.deps_need_build.contains(id)
  }

  fn is_building(&self, id: &TargetId) -> bool {
    self.needs_own_build(id) || self.deps_need_build(id)
  }

  /// Targets in the order they will be visited.
  pub fn sorted_targets(&self) -> &[TargetSpec] {
    &self.sorted
  }

  /// Run the handler for every target that needs it, in dependency order.
  ///
  /// A failing handler does not stop independent targets; its dependents are
  /// recorded as skipped. Only a fatal error aborts the round.
  pub async fn run_builds(&mut self, builder: &dyn TargetBuilder) -> Result<(), BuildError> {
    let sorted = self.sorted.clone();
    for spec in &sorted {
      let id = spec.id();
      if !self.is_building(&id) {
        continue;
      }

      let blocked_by = spec.dependency_ids().iter().find(|dep| {
        self.skipped.contains_key(*dep) || self.failed.iter().any(|f| &f.target == *dep)
      });
      if let Some(dep) = blocked_by {
        warn!(target = %id, failed_dep = %dep, "skipping build due to failed dependency");
        self.skipped.insert(id, dep.clone());
        continue;
      }

      let dependency_results = self.dependency_results(spec);
      let empty = BuildState::default();
      let state = if self.deps_need_build(&id) {
        &empty
      } else {
        self.state.get(&id).unwrap_or(&empty)
      };

      info!(target = %id, "building target");
      match builder.build(spec, state, &dependency_results).await {
        Ok(result) => {
          debug!(target = %id, kind = result.kind_label(), "target built");
          self.results.insert(id, result);
        }
        Err(e) if e.is_fatal() => {
          error!(target = %id, error = %e, "build aborted");
          return Err(e);
        }
        Err(e) => {
          error!(target = %id, error = %e, "target failed");
          self.failed.push(TargetFailure { target: id, error: e });
        }
      }
    }
    Ok(())
  }

  /// Results of a target's direct dependencies, in declared order.
  fn dependency_results(&self, spec: &TargetSpec) -> Vec<BuildResult> {
    spec
      .dependency_ids()
      .iter()
      .filter_map(|dep| self.results.get(dep).or_else(|| self.reused.get(dep)).cloned())
      .collect()
  }

  /// Results produced by handlers in this round.
  pub fn new_results(&self) -> &BuildResultSet {
    &self.results
  }

  /// Results carried over from the previous round.
  pub fn reused_results(&self) -> &BuildResultSet {
    &self.reused
  }

  pub fn all_results(&self) -> BuildResultSet {
    let mut all = self.reused.clone();
    all.extend(self.results.iter().map(|(id, r)| (id.clone(), r.clone())));
    all
  }

  /// Number of handler invocations that succeeded.
  pub fn count_builds(&self) -> usize {
    self.results.len()
  }

  pub fn failures(&self) -> &[TargetFailure] {
    &self.failed
  }

  pub fn skipped(&self) -> &BTreeMap<TargetId, TargetId> {
    &self.skipped
  }

  /// Consume the queue. `Ok` with every result if nothing failed.
  pub fn into_outcome(self) -> Result<BuildResultSet, BuildError> {
    let completed = self.all_results();
    if self.failed.is_empty() {
      return Ok(completed);
    }
    Err(BuildError::TargetsFailed {
      failures: self.failed,
      completed,
    })
  }
}

async fn artifact_exists(
  id: &TargetId,
  state: Option<&BuildState>,
  checker: &dyn ImageChecker,
) -> Result<bool, QueueError> {
  let Some(image_ref) = state.and_then(|s| s.last_result.as_ref()).and_then(BuildResult::image_ref) else {
    return Ok(true);
  };
  let exists = checker
    .image_exists(image_ref)
    .await
    .map_err(|source| QueueError::ImageCheck {
      target: id.clone(),
      image_ref: image_ref.to_string(),
      source,
    })?;
  if !exists {
    info!(target = %id, image = image_ref, "previous image is gone, rebuilding");
  }
  Ok(exists)
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use super::*;
  use crate::util::testutil::{FakeBuilder, FakeImageChecker, image, image_result, k8s};

  fn built(name: &str) -> BuildState {
    BuildState::new(Some(image_result(name, &format!("registry/{name}:old"))), [])
  }

  fn changed(name: &str) -> BuildState {
    BuildState::new(
      Some(image_result(name, &format!("registry/{name}:old"))),
      [PathBuf::from(format!("/src/{name}/main.go"))],
    )
  }

  #[tokio::test]
  async fn only_dirty_target_is_built_with_dependency_results() {
    let specs = vec![image("foo", &[]), image("bar", &["image:foo"])];
    let mut state = BuildStateSet::new();
    state.insert(TargetId::image("foo"), built("foo"));
    state.insert(TargetId::image("bar"), BuildState::default());

    let mut queue = TargetQueue::new(&specs, state, &FakeImageChecker::all_present()).await.unwrap();
    let builder = FakeBuilder::default();
    queue.run_builds(&builder).await.unwrap();

    let calls = builder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].target, TargetId::image("bar"));
    assert_eq!(
      calls[0].dependency_results,
      vec![image_result("foo", "registry/foo:old")]
    );
    assert_eq!(queue.count_builds(), 1);
    assert_eq!(queue.reused_results().len(), 1);
    assert_eq!(queue.all_results().len(), 2);
  }

  #[tokio::test]
  async fn handlers_run_after_their_dependencies() {
    let specs = vec![
      k8s("app", &["image:left", "image:right"]),
      image("right", &["image:base"]),
      image("left", &["image:base"]),
      image("base", &[]),
    ];
    let mut queue = TargetQueue::new(&specs, BuildStateSet::new(), &FakeImageChecker::all_present())
      .await
      .unwrap();
    let builder = FakeBuilder::default();
    queue.run_builds(&builder).await.unwrap();

    let order: Vec<TargetId> = builder.calls().into_iter().map(|c| c.target).collect();
    for spec in &specs {
      let pos = order.iter().position(|id| id == &spec.id()).unwrap();
      for dep in spec.dependency_ids() {
        let dep_pos = order.iter().position(|id| id == dep).unwrap();
        assert!(dep_pos < pos, "{dep} should build before {}", spec.id());
      }
    }
  }

  #[tokio::test]
  async fn dirty_dependency_propagates_and_clears_state() {
    let specs = vec![
      image("base", &[]),
      image("server", &["image:base"]),
      k8s("app", &["image:server"]),
    ];
    let mut state = BuildStateSet::new();
    state.insert(TargetId::image("base"), changed("base"));
    state.insert(TargetId::image("server"), changed("server"));
    state.insert(TargetId::k8s("app"), BuildState::new(Some(image_result("app", "unused")), []));

    let mut queue = TargetQueue::new(&specs, state, &FakeImageChecker::all_present()).await.unwrap();
    assert!(queue.needs_own_build(&TargetId::image("base")));
    assert!(queue.deps_need_build(&TargetId::image("server")));
    assert!(queue.deps_need_build(&TargetId::k8s("app")));
    assert!(queue.reused_results().is_empty());

    let builder = FakeBuilder::default();
    queue.run_builds(&builder).await.unwrap();
    let calls = builder.calls();

    // base builds incrementally from its own state, dependents start clean.
    assert_eq!(calls[0].files_changed, vec![PathBuf::from("/src/base/main.go")]);
    assert!(calls[1].state_was_empty);
    assert!(calls[2].state_was_empty);
  }

  #[tokio::test]
  async fn missing_image_forces_rebuild() {
    let specs = vec![image("foo", &[])];
    let mut state = BuildStateSet::new();
    state.insert(TargetId::image("foo"), built("foo"));

    let checker = FakeImageChecker::present(&[]);
    let queue = TargetQueue::new(&specs, state, &checker).await.unwrap();
    assert!(queue.needs_own_build(&TargetId::image("foo")));
    assert_eq!(checker.checked(), vec!["registry/foo:old".to_string()]);
  }

  #[tokio::test]
  async fn existence_check_failure_aborts_construction() {
    let specs = vec![image("foo", &[])];
    let mut state = BuildStateSet::new();
    state.insert(TargetId::image("foo"), built("foo"));

    let err = TargetQueue::new(&specs, state, &FakeImageChecker::failing("daemon down"))
      .await
      .unwrap_err();
    assert!(matches!(err, QueueError::ImageCheck { .. }));
  }

  #[tokio::test]
  async fn cycle_is_rejected_before_building() {
    let specs = vec![image("a", &["image:b"]), image("b", &["image:a"])];
    let err = TargetQueue::new(&specs, BuildStateSet::new(), &FakeImageChecker::all_present())
      .await
      .unwrap_err();
    assert!(matches!(err, QueueError::Graph(GraphError::Cycle(_))));
  }

  #[tokio::test]
  async fn failure_skips_dependents_but_not_independent_targets() {
    let specs = vec![
      image("bad", &[]),
      image("good", &[]),
      image("child", &["image:bad"]),
      k8s("app", &["image:child", "image:good"]),
    ];
    let mut queue = TargetQueue::new(&specs, BuildStateSet::new(), &FakeImageChecker::all_present())
      .await
      .unwrap();
    let builder = FakeBuilder::failing(&[TargetId::image("bad")]);
    queue.run_builds(&builder).await.unwrap();

    assert!(queue.new_results().contains_key(&TargetId::image("good")));
    assert_eq!(queue.failures().len(), 1);
    assert_eq!(queue.skipped()[&TargetId::image("child")], TargetId::image("bad"));
    assert_eq!(queue.skipped()[&TargetId::k8s("app")], TargetId::image("child"));

    let err = queue.into_outcome().unwrap_err();
    match err {
      BuildError::TargetsFailed { failures, completed } => {
        assert_eq!(failures[0].target, TargetId::image("bad"));
        assert!(completed.contains_key(&TargetId::image("good")));
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[tokio::test]
  async fn cancellation_aborts_the_round() {
    let specs = vec![image("a", &[]), image("b", &[])];
    let mut queue = TargetQueue::new(&specs, BuildStateSet::new(), &FakeImageChecker::all_present())
      .await
      .unwrap();
    let builder = FakeBuilder::canceling(&[TargetId::image("a")]);
    let err = queue.run_builds(&builder).await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(builder.calls().len(), 1);
  }

  #[tokio::test]
  async fn clean_targets_are_never_handed_to_the_builder() {
    let specs = vec![image("a", &[]), image("b", &["image:a"])];
    let mut state = BuildStateSet::new();
    state.insert(TargetId::image("a"), built("a"));
    state.insert(TargetId::image("b"), built("b"));

    let mut queue = TargetQueue::new(&specs, state, &FakeImageChecker::all_present()).await.unwrap();
    let builder = FakeBuilder::default();
    queue.run_builds(&builder).await.unwrap();
    assert!(builder.calls().is_empty());
    assert_eq!(queue.into_outcome().unwrap().len(), 2);
  }
}
