//! State transitions applied to the engine state under the write lock.
//!
//! Every function here is synchronous and does no I/O. Callers hold the write
//! lock (see [`super::SharedEngineState::write`]) for the duration of one call.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::build_result::{BuildResult, BuildResultSet};
use super::engine_state::{BuildRecord, ConfigFileState, DisableState, EngineState, ManifestTarget};
use super::runtime::{RuntimeState, RuntimeStatus};
use crate::model::{Manifest, ManifestName, TargetId};

const MAX_BUILD_HISTORY: usize = 10;

/// How a failed build should affect pending changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  /// The user's build or command failed. Wait for the next change.
  Build,
  /// Checking or talking to external systems failed. Retry on the next pass.
  Infrastructure,
  /// Cancelled. Recorded, never retried.
  Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFailure {
  pub kind: FailureKind,
  pub message: String,
}

/// The outcome of one build round for a manifest.
#[derive(Debug, Clone)]
pub struct BuildCompleted {
  pub manifest: ManifestName,
  pub start_time: DateTime<Utc>,
  pub finish_time: DateTime<Utc>,
  /// Results for targets that completed, including reused ones.
  pub results: BuildResultSet,
  pub failure: Option<BuildFailure>,
}

/// Files under `target` changed. Every manifest that contains the target sees
/// the change; the earliest observation of each file is kept.
pub fn handle_file_change(state: &mut EngineState, target: &TargetId, files: &[PathBuf], time: DateTime<Utc>) {
  let mut matched = false;
  for mt in state.manifest_targets.iter_mut().filter(|mt| mt.manifest.contains_target(target)) {
    matched = true;
    let status = mt.state.build_status_mut(target);
    for file in files {
      status.pending_file_changes.entry(file.clone()).or_insert(time);
    }
    debug!(manifest = %mt.name(), target = %target, files = files.len(), "recorded file changes");
  }
  if !matched {
    warn!(target = %target, "file change for unknown target");
  }
}

/// A config file changed; everything waits until it reloads.
pub fn handle_config_change(state: &mut EngineState, name: &str, files: &[PathBuf], time: DateTime<Utc>) {
  let index = match state.config_files.iter().position(|c| c.name == name) {
    Some(index) => index,
    None => {
      state.config_files.push(ConfigFileState {
        name: name.to_string(),
        ..Default::default()
      });
      state.config_files.len() - 1
    }
  };
  let config = &mut state.config_files[index];
  for file in files {
    config.pending_changes.entry(file.clone()).or_insert(time);
  }
  info!(config = name, files = files.len(), "config changed, holding builds until reload");
}

/// A config file finished loading and declared `manifests`.
///
/// Manifests keep their state across the reload; a manifest whose definition
/// changed gets a pending config change. Manifests no longer declared are
/// dropped.
pub fn handle_config_loaded(state: &mut EngineState, name: &str, manifests: Vec<Manifest>, time: DateTime<Utc>) {
  if let Some(config) = state.config_files.iter_mut().find(|c| c.name == name) {
    config.pending_changes.retain(|_, seen| *seen > time);
  }

  let mut previous: Vec<ManifestTarget> = std::mem::take(&mut state.manifest_targets);
  for manifest in manifests {
    let mt = match previous.iter().position(|mt| mt.manifest.name == manifest.name) {
      Some(index) => {
        let mut mt = previous.remove(index);
        if mt.manifest != manifest {
          debug!(manifest = %manifest.name, "manifest definition changed");
          mt.state.pending_manifest_change = Some(time);
          mt.manifest = manifest;
        }
        mt
      }
      None => ManifestTarget::new(manifest),
    };
    state.manifest_targets.push(mt);
  }

  for removed in &previous {
    info!(manifest = %removed.name(), "manifest removed by config reload");
  }
  let known: Vec<ManifestName> = state.manifest_targets.iter().map(|mt| mt.name().clone()).collect();
  state.trigger_queue.retain(|name| known.contains(name));
}

/// The user asked for a manifest to build. Requests for a manifest already
/// in the queue keep their position.
pub fn handle_trigger(state: &mut EngineState, name: &ManifestName) {
  if state.manifest_target(name).is_none() {
    warn!(manifest = %name, "trigger for unknown manifest");
    return;
  }
  if !state.trigger_queue.contains(name) {
    state.trigger_queue.push(name.clone());
  }
}

pub fn handle_disable(state: &mut EngineState, name: &ManifestName, disabled: bool) {
  if let Some(mt) = state.manifest_target_mut(name) {
    mt.state.disable = if disabled {
      DisableState::Disabled
    } else {
      DisableState::Enabled
    };
  }
}

/// New runtime status for a manifest.
///
/// A container that restarts after a live update has lost the patched files,
/// so the manifest is flagged for a rebuild.
pub fn handle_runtime_update(state: &mut EngineState, name: &ManifestName, runtime: RuntimeState) {
  let Some(mt) = state.manifest_target_mut(name) else {
    return;
  };
  let ever_ready = mt.state.runtime.ever_ready || runtime.status == RuntimeStatus::Ok;
  let restarted = runtime.restarts() > mt.state.runtime.restarts();
  let live_updated = mt
    .state
    .build_statuses
    .values()
    .any(|s| matches!(s.last_result, Some(BuildResult::LiveUpdate { .. })));

  if restarted && live_updated {
    info!(manifest = %name, "container restarted after live update, rebuilding");
    mt.state.needs_rebuild_from_crash = true;
  }
  mt.state.runtime = RuntimeState { ever_ready, ..runtime };
}

/// Mark a manifest as building. Returns the new build record, or `None` if
/// the manifest is unknown or already building.
pub fn handle_build_started(
  state: &mut EngineState,
  name: &ManifestName,
  start_time: DateTime<Utc>,
) -> Option<BuildRecord> {
  let mt = state.manifest_target(name)?;
  if mt.state.is_building() {
    warn!(manifest = %name, "build started for manifest that is already building");
    return None;
  }
  let reason = state.next_build_reason(mt);
  state.trigger_queue.retain(|n| n != name);

  let mt = state.manifest_target_mut(name)?;

  let edits: Vec<PathBuf> = {
    let mut all: Vec<PathBuf> = mt.state.build_statuses.values().flat_map(|s| s.pending_files()).collect();
    all.sort();
    all.dedup();
    all
  };
  let record = BuildRecord::started(start_time, reason, edits);
  mt.state.current_build = Some(record.clone());
  mt.state.needs_rebuild_from_crash = false;

  info!(manifest = %name, reason = %reason, "build started");
  Some(record)
}

/// Apply the outcome of a build round.
pub fn handle_build_completed(state: &mut EngineState, completed: BuildCompleted) {
  let BuildCompleted {
    manifest: name,
    start_time,
    finish_time,
    results,
    failure,
  } = completed;

  let Some(mt) = state.manifest_target_mut(&name) else {
    warn!(manifest = %name, "build completed for unknown manifest");
    return;
  };

  let mut record = mt
    .state
    .current_build
    .take()
    .unwrap_or_else(|| BuildRecord::started(start_time, Default::default(), Vec::new()));
  record.finish_time = Some(finish_time);

  let mut changed = Vec::new();
  for (id, result) in &results {
    let status = mt.state.build_status_mut(id);
    if status.last_result.as_ref() != Some(result) {
      changed.push(id.clone());
    }
    status.last_result = Some(result.clone());
  }

  let keep_pending = matches!(&failure, Some(f) if f.kind == FailureKind::Infrastructure);
  if !keep_pending {
    for status in mt.state.build_statuses.values_mut() {
      status.clear_pending_changes_before(start_time);
    }
    if mt.state.pending_manifest_change.is_some_and(|t| t <= start_time) {
      mt.state.pending_manifest_change = None;
    }
  }

  match &failure {
    None => {
      if mt.manifest.is_local() {
        mt.state.runtime.status = RuntimeStatus::NotApplicable;
        mt.state.runtime.ever_ready = true;
      }
      info!(manifest = %name, built = results.len(), "build succeeded");
    }
    Some(f) => {
      record.error = Some(f.message.clone());
      record.fatal = f.kind == FailureKind::Fatal;
      warn!(manifest = %name, kind = ?f.kind, error = %f.message, "build failed");
    }
  }

  mt.state.build_history.insert(0, record);
  mt.state.build_history.truncate(MAX_BUILD_HISTORY);

  propagate_results(state, &name, &results, &changed, start_time, finish_time);
}

/// Share fresh results with other manifests that contain the same target,
/// and mark their dependents as having a changed dependency.
fn propagate_results(
  state: &mut EngineState,
  built_by: &ManifestName,
  results: &BuildResultSet,
  changed: &[TargetId],
  start_time: DateTime<Utc>,
  finish_time: DateTime<Utc>,
) {
  for mt in state.manifest_targets.iter_mut().filter(|mt| mt.name() != built_by) {
    for id in changed {
      if mt.manifest.contains_target(id) {
        let status = mt.state.build_status_mut(id);
        status.last_result = results.get(id).cloned();
        status.clear_pending_changes_before(start_time);
      }
    }

    let specs = mt.manifest.targets.clone();
    for spec in &specs {
      for dep in spec.dependency_ids().iter().filter(|d| changed.contains(d)) {
        mt.state
          .build_status_mut(&spec.id())
          .pending_dependency_changes
          .insert(dep.clone(), finish_time);
        debug!(manifest = %mt.name(), target = %spec.id(), dependency = %dep, "dependency rebuilt");
      }
    }
  }
}
