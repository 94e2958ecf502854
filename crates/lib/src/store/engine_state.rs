//! The engine's view of every manifest and what has happened to it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::build_result::{BuildResult, BuildState, BuildStateSet};
use super::runtime::RuntimeState;
use crate::liveupdate::{running_containers_for_compose, running_containers_for_pods};
use crate::model::{Manifest, ManifestName, TargetId, TargetSpec};

/// Why a manifest is (or would be) built, as a set of flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildReason(u16);

impl BuildReason {
  pub const NONE: BuildReason = BuildReason(0);
  pub const CHANGED_FILES: BuildReason = BuildReason(1 << 0);
  pub const CHANGED_DEPS: BuildReason = BuildReason(1 << 1);
  pub const CONFIG: BuildReason = BuildReason(1 << 2);
  pub const INIT: BuildReason = BuildReason(1 << 3);
  pub const CRASH: BuildReason = BuildReason(1 << 4);
  pub const TRIGGER: BuildReason = BuildReason(1 << 5);

  const NAMES: [(BuildReason, &'static str); 6] = [
    (BuildReason::INIT, "initial build"),
    (BuildReason::CHANGED_FILES, "changed files"),
    (BuildReason::CHANGED_DEPS, "dependency updated"),
    (BuildReason::CONFIG, "config changed"),
    (BuildReason::CRASH, "pod crashed"),
    (BuildReason::TRIGGER, "manual trigger"),
  ];

  pub fn with(self, other: BuildReason) -> BuildReason {
    BuildReason(self.0 | other.0)
  }

  pub fn without(self, other: BuildReason) -> BuildReason {
    BuildReason(self.0 & !other.0)
  }

  pub fn has(self, other: BuildReason) -> bool {
    other.0 != 0 && self.0 & other.0 == other.0
  }

  pub fn is_empty(self) -> bool {
    self.0 == 0
  }

  pub fn has_trigger(self) -> bool {
    self.has(BuildReason::TRIGGER)
  }
}

impl fmt::Display for BuildReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_empty() {
      return f.write_str("unknown");
    }
    let names: Vec<&str> = Self::NAMES
      .iter()
      .filter(|(flag, _)| self.has(*flag))
      .map(|(_, name)| *name)
      .collect();
    f.write_str(&names.join(" | "))
  }
}

/// Pending-change bookkeeping for one target within a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildStatus {
  pub last_result: Option<BuildResult>,
  /// Changed file -> when the change was observed.
  pub pending_file_changes: BTreeMap<PathBuf, DateTime<Utc>>,
  /// Dependency rebuilt elsewhere -> when it finished.
  pub pending_dependency_changes: BTreeMap<TargetId, DateTime<Utc>>,
}

impl BuildStatus {
  pub fn has_pending_file_changes(&self) -> bool {
    !self.pending_file_changes.is_empty()
  }

  pub fn has_pending_dependency_changes(&self) -> bool {
    !self.pending_dependency_changes.is_empty()
  }

  pub fn pending_files(&self) -> Vec<PathBuf> {
    self.pending_file_changes.keys().cloned().collect()
  }

  fn earliest_pending_change(&self) -> Option<DateTime<Utc>> {
    self
      .pending_file_changes
      .values()
      .chain(self.pending_dependency_changes.values())
      .min()
      .copied()
  }

  /// Forget changes seen at or before `time`. Later changes are kept for the
  /// next build.
  pub fn clear_pending_changes_before(&mut self, time: DateTime<Utc>) {
    self.pending_file_changes.retain(|_, seen| *seen > time);
    self.pending_dependency_changes.retain(|_, seen| *seen > time);
  }
}

/// One build of a manifest, finished or in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
  pub start_time: DateTime<Utc>,
  pub finish_time: Option<DateTime<Utc>>,
  pub reason: BuildReason,
  #[serde(default)]
  pub edits: Vec<PathBuf>,
  #[serde(default)]
  pub error: Option<String>,
  /// The build was cancelled or otherwise can never succeed by retrying.
  #[serde(default)]
  pub fatal: bool,
}

impl BuildRecord {
  pub fn started(start_time: DateTime<Utc>, reason: BuildReason, edits: Vec<PathBuf>) -> Self {
    Self {
      start_time,
      finish_time: None,
      reason,
      edits,
      error: None,
      fatal: false,
    }
  }

  pub fn succeeded(&self) -> bool {
    self.finish_time.is_some() && self.error.is_none()
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisableState {
  #[default]
  Enabled,
  Disabled,
}

/// Mutable state of one manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestState {
  pub build_statuses: BTreeMap<TargetId, BuildStatus>,
  pub current_build: Option<BuildRecord>,
  /// Most recent first.
  pub build_history: Vec<BuildRecord>,
  pub pending_manifest_change: Option<DateTime<Utc>>,
  pub needs_rebuild_from_crash: bool,
  pub runtime: RuntimeState,
  pub disable: DisableState,
}

impl ManifestState {
  pub fn is_building(&self) -> bool {
    self.current_build.is_some()
  }

  pub fn started_first_build(&self) -> bool {
    self.is_building() || !self.build_history.is_empty()
  }

  pub fn last_build(&self) -> Option<&BuildRecord> {
    self.build_history.first()
  }

  pub fn is_disabled(&self) -> bool {
    self.disable == DisableState::Disabled
  }

  pub fn build_status(&self, id: &TargetId) -> Option<&BuildStatus> {
    self.build_statuses.get(id)
  }

  pub fn build_status_mut(&mut self, id: &TargetId) -> &mut BuildStatus {
    self.build_statuses.entry(id.clone()).or_default()
  }

  pub fn has_pending_file_changes(&self) -> bool {
    self.build_statuses.values().any(BuildStatus::has_pending_file_changes)
  }

  pub fn has_pending_dependency_changes(&self) -> bool {
    self.build_statuses.values().any(BuildStatus::has_pending_dependency_changes)
  }

  pub fn has_pending_changes(&self) -> bool {
    self.has_pending_file_changes() || self.has_pending_dependency_changes() || self.pending_manifest_change.is_some()
  }

  /// The earliest change of any kind that has not been built yet.
  pub fn earliest_pending_change(&self) -> Option<DateTime<Utc>> {
    self
      .build_statuses
      .values()
      .filter_map(BuildStatus::earliest_pending_change)
      .chain(self.pending_manifest_change)
      .min()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestTarget {
  pub manifest: Manifest,
  #[serde(default)]
  pub state: ManifestState,
}

impl ManifestTarget {
  pub fn new(manifest: Manifest) -> Self {
    Self {
      manifest,
      state: ManifestState::default(),
    }
  }

  pub fn name(&self) -> &ManifestName {
    &self.manifest.name
  }
}

/// A config-loading unit, e.g. the project file that declares manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFileState {
  pub name: String,
  pub pending_changes: BTreeMap<PathBuf, DateTime<Utc>>,
}

impl ConfigFileState {
  pub fn has_pending_changes(&self) -> bool {
    !self.pending_changes.is_empty()
  }

  pub fn id(&self) -> TargetId {
    TargetId::config_file(self.name.clone())
  }
}

/// Status reported by a live update reconciler for one image target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveUpdateStatus {
  pub failed: Option<String>,
}

/// Everything the scheduler looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineState {
  /// In declaration order.
  pub manifest_targets: Vec<ManifestTarget>,
  pub config_files: Vec<ConfigFileState>,
  /// Manifests the user asked to build, oldest request first.
  pub trigger_queue: Vec<ManifestName>,
  /// Reconciler status keyed by image target.
  pub live_updates: BTreeMap<TargetId, LiveUpdateStatus>,
}

impl EngineState {
  pub fn new(manifests: impl IntoIterator<Item = Manifest>) -> Self {
    Self {
      manifest_targets: manifests.into_iter().map(ManifestTarget::new).collect(),
      ..Self::default()
    }
  }

  pub fn targets(&self) -> &[ManifestTarget] {
    &self.manifest_targets
  }

  pub fn manifest_target(&self, name: &ManifestName) -> Option<&ManifestTarget> {
    self.manifest_targets.iter().find(|mt| mt.name() == name)
  }

  pub fn manifest_target_mut(&mut self, name: &ManifestName) -> Option<&mut ManifestTarget> {
    self.manifest_targets.iter_mut().find(|mt| mt.name() == name)
  }

  pub fn currently_building(&self) -> Vec<&ManifestName> {
    self
      .manifest_targets
      .iter()
      .filter(|mt| mt.state.is_building())
      .map(ManifestTarget::name)
      .collect()
  }

  pub fn is_building_anything(&self) -> bool {
    self.manifest_targets.iter().any(|mt| mt.state.is_building())
  }

  pub fn is_triggered(&self, name: &ManifestName) -> bool {
    self.trigger_queue.contains(name)
  }

  pub fn next_build_reason(&self, mt: &ManifestTarget) -> BuildReason {
    let state = &mt.state;
    let mut reason = BuildReason::NONE;
    if self.is_triggered(mt.name()) {
      reason = reason.with(BuildReason::TRIGGER);
    }
    if state.has_pending_file_changes() {
      reason = reason.with(BuildReason::CHANGED_FILES);
    }
    if state.has_pending_dependency_changes() {
      reason = reason.with(BuildReason::CHANGED_DEPS);
    }
    if state.pending_manifest_change.is_some() {
      reason = reason.with(BuildReason::CONFIG);
    }
    if !state.started_first_build() && mt.manifest.trigger_mode.auto_initial() {
      reason = reason.with(BuildReason::INIT);
    }
    if state.needs_rebuild_from_crash {
      reason = reason.with(BuildReason::CRASH);
    }
    reason
  }

  /// Snapshot the per-target build state for a manifest's next build.
  ///
  /// A manual trigger forces a full build unless it only asks to live update
  /// already-pending file changes.
  pub fn build_state_set_for(&self, mt: &ManifestTarget) -> BuildStateSet {
    let reason = self.next_build_reason(mt);
    let full_build_triggered = reason.has_trigger() && !is_live_update_eligible_trigger(&mt.manifest, reason);

    let mut set = BuildStateSet::new();
    for spec in mt.manifest.target_specs() {
      let id = spec.id();
      let status = mt.state.build_status(&id).cloned().unwrap_or_default();

      let mut state = BuildState::new(status.last_result, status.pending_file_changes.into_keys())
        .with_deps_changed(status.pending_dependency_changes.into_keys())
        .with_full_build_triggered(full_build_triggered);

      if let TargetSpec::Image(image) = spec {
        if mt.manifest.is_k8s() {
          match running_containers_for_pods(&image.selector, &image.image_ref, &mt.state.runtime.pods) {
            Ok(containers) => state = state.with_running_containers(containers),
            Err(e) => state.running_containers_error = Some(e.to_string()),
          }
        } else if mt.manifest.is_docker_compose() {
          let containers = running_containers_for_compose(mt.state.runtime.compose_container.as_ref());
          state = state.with_running_containers(containers);
        }
      }

      set.insert(id, state);
    }
    set
  }
}

/// A trigger on a manual manifest whose only other reason is changed files
/// may be served by a live update.
pub fn is_live_update_eligible_trigger(manifest: &Manifest, reason: BuildReason) -> bool {
  reason.has_trigger()
    && reason.without(BuildReason::TRIGGER) == BuildReason::CHANGED_FILES
    && !manifest.trigger_mode.auto_on_change()
}
