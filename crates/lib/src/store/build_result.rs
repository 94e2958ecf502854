//! Build results and the per-round build state derived from them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::liveupdate::Container;
use crate::model::TargetId;

/// The output of one successful build, tagged by what produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BuildResult {
  /// A freshly built image.
  Image { target: TargetId, image_ref: String },

  /// Files were patched into running containers on top of `image_ref`.
  LiveUpdate {
    target: TargetId,
    image_ref: Option<String>,
    container_ids: Vec<String>,
  },

  /// A local command ran to completion.
  LocalExec { target: TargetId },

  /// Objects were applied to the cluster.
  K8sDeploy {
    target: TargetId,
    applied_entities: Vec<String>,
  },

  /// A compose service was brought up.
  DockerCompose {
    target: TargetId,
    container_id: Option<String>,
  },
}

impl BuildResult {
  pub fn target_id(&self) -> &TargetId {
    match self {
      BuildResult::Image { target, .. }
      | BuildResult::LiveUpdate { target, .. }
      | BuildResult::LocalExec { target }
      | BuildResult::K8sDeploy { target, .. }
      | BuildResult::DockerCompose { target, .. } => target,
    }
  }

  /// The image artifact this result refers to, if any.
  pub fn image_ref(&self) -> Option<&str> {
    match self {
      BuildResult::Image { image_ref, .. } => Some(image_ref),
      BuildResult::LiveUpdate { image_ref, .. } => image_ref.as_deref(),
      _ => None,
    }
  }

  pub fn kind_label(&self) -> &'static str {
    match self {
      BuildResult::Image { .. } => "image build",
      BuildResult::LiveUpdate { .. } => "live update",
      BuildResult::LocalExec { .. } => "local exec",
      BuildResult::K8sDeploy { .. } => "k8s deploy",
      BuildResult::DockerCompose { .. } => "docker-compose",
    }
  }
}

pub type BuildResultSet = BTreeMap<TargetId, BuildResult>;

/// What a target looked like since its last successful build.
///
/// Created fresh for every build round from accumulated file events, read
/// once by the target queue, then superseded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildState {
  pub last_result: Option<BuildResult>,

  /// Files changed since `last_result`. Liberal: too many is fine, too few is not.
  pub files_changed: BTreeSet<PathBuf>,

  /// Dependencies rebuilt by another manifest since `last_result`.
  pub deps_changed: BTreeSet<TargetId>,

  /// The user asked for this build explicitly.
  pub full_build_triggered: bool,

  /// Containers currently running this target's image.
  pub running_containers: Vec<Container>,

  /// Set when the running containers could not be determined.
  pub running_containers_error: Option<String>,
}

impl BuildState {
  pub fn new(last_result: Option<BuildResult>, files: impl IntoIterator<Item = PathBuf>) -> Self {
    Self {
      last_result,
      files_changed: files.into_iter().collect(),
      ..Self::default()
    }
  }

  pub fn with_full_build_triggered(mut self, triggered: bool) -> Self {
    self.full_build_triggered = triggered;
    self
  }

  pub fn with_running_containers(mut self, containers: Vec<Container>) -> Self {
    self.running_containers = containers;
    self
  }

  pub fn with_deps_changed(mut self, deps: impl IntoIterator<Item = TargetId>) -> Self {
    self.deps_changed = deps.into_iter().collect();
    self
  }

  /// Changed files in sorted order.
  pub fn files_changed(&self) -> Vec<PathBuf> {
    self.files_changed.iter().cloned().collect()
  }

  /// No previous result to build on.
  pub fn is_empty(&self) -> bool {
    self.last_result.is_none()
  }

  /// Whether a fresh build is required regardless of artifact existence.
  ///
  /// A target with a previous result and nothing changed since may reuse it.
  pub fn needs_build(&self) -> bool {
    self.last_result.is_none()
      || !self.files_changed.is_empty()
      || !self.deps_changed.is_empty()
      || self.full_build_triggered
  }
}

pub type BuildStateSet = BTreeMap<TargetId, BuildState>;

/// All files changed across a state set, deduplicated and sorted.
pub fn files_changed(set: &BuildStateSet) -> Vec<PathBuf> {
  let all: BTreeSet<&PathBuf> = set.values().flat_map(|s| s.files_changed.iter()).collect();
  all.into_iter().cloned().collect()
}
