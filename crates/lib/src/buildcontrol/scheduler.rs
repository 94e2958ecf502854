//! Picking the next manifest to build.
//!
//! [`next_target_to_build`] is a pure function of the engine state. It holds
//! back every manifest that must not build right now, recording why, and
//! then picks one of the rest by priority.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::liveupdate::{containers::matches_selector, plan_with};
use crate::model::{ManifestName, TargetId, TargetKind, TargetSpec, UNRESOURCED_YAML_MANIFEST_NAME};
use crate::store::{
  BuildReason, BuildResult, BuildStatus, EngineState, Hold, HoldReason, HoldSet, ManifestTarget, RuntimeStatus,
  is_live_update_eligible_trigger,
};

/// The manifest to build next, if any, and the holds on everything else.
pub fn next_target_to_build(state: &EngineState) -> (Option<&ManifestTarget>, HoldSet) {
  let mut holds = HoldSet::new();
  let targets = state.targets();
  let names = || targets.iter().map(ManifestTarget::name);

  // Config must reload before anything builds.
  if let Some(config) = state.config_files.iter().find(|c| c.has_pending_changes()) {
    holds.fill(names(), Hold::on(HoldReason::ConfigReload, vec![config.id()]));
    debug!(config = %config.name, "holding all manifests for config reload");
    return (None, holds);
  }

  if let Some(name) = building_unparallelizable_local_target(state) {
    holds.fill(
      names(),
      Hold::on(HoldReason::WaitingForUnparallelizableTarget, vec![name.target_id()]),
    );
    return (None, holds);
  }

  if state.is_building_anything() {
    hold_unparallelizable_local_targets(targets, &mut holds);
  }

  if is_building_uncategorized_yaml(state) {
    hold_k8s_targets(targets, &mut holds);
  }

  hold_targets_with_building_components(state, &mut holds);
  hold_targets_waiting_on_dependencies(state, &mut holds);
  hold_disabled_targets(targets, &mut holds);

  let unbuilt: Vec<&ManifestTarget> = targets
    .iter()
    .filter(|mt| holds.is_eligible(mt.name()))
    .filter(|mt| !mt.state.started_first_build() && mt.manifest.trigger_mode.auto_initial())
    .collect();
  if let Some(next) = next_unbuilt_target_to_build(&unbuilt) {
    debug!(manifest = %next.name(), "picked unbuilt manifest");
    return (Some(next), holds);
  }

  if let Some(mt) = targets
    .iter()
    .find(|mt| holds.is_eligible(mt.name()) && mt.state.needs_rebuild_from_crash)
  {
    debug!(manifest = %mt.name(), "picked manifest that needs rebuild after crash");
    return (Some(mt), holds);
  }

  for name in &state.trigger_queue {
    if let Some(mt) = state.manifest_target(name)
      && holds.is_eligible(name)
    {
      debug!(manifest = %name, "picked manually triggered manifest");
      return (Some(mt), holds);
    }
  }

  hold_live_update_targets_waiting_on_deploy(state, &mut holds);
  hold_live_update_targets_handled_by_reconciler(state, &mut holds);

  let eligible: Vec<&ManifestTarget> = holds.remove_ineligible(targets.iter().collect(), ManifestTarget::name);
  let next = earliest_pending_auto_trigger_target(&eligible);
  if let Some(mt) = next {
    debug!(manifest = %mt.name(), "picked manifest with earliest pending change");
  }
  (next, holds)
}

/// The unparallelizable local manifest that is building, if any.
pub fn building_unparallelizable_local_target(state: &EngineState) -> Option<&ManifestName> {
  state
    .targets()
    .iter()
    .find(|mt| mt.state.is_building() && mt.manifest.is_unparallelizable_local())
    .map(ManifestTarget::name)
}

pub fn is_building_uncategorized_yaml(state: &EngineState) -> bool {
  state
    .targets()
    .iter()
    .any(|mt| mt.state.is_building() && mt.manifest.is_unresourced_yaml())
}

fn hold_unparallelizable_local_targets(targets: &[ManifestTarget], holds: &mut HoldSet) {
  for mt in targets.iter().filter(|mt| mt.manifest.is_unparallelizable_local()) {
    holds.add_hold(mt.name(), Hold::new(HoldReason::IsUnparallelizableTarget));
  }
}

fn hold_k8s_targets(targets: &[ManifestTarget], holds: &mut HoldSet) {
  let uncategorized = ManifestName::new(UNRESOURCED_YAML_MANIFEST_NAME).target_id();
  for mt in targets.iter().filter(|mt| mt.manifest.is_k8s()) {
    holds.add_hold(
      mt.name(),
      Hold::on(HoldReason::WaitingForUncategorized, vec![uncategorized.clone()]),
    );
  }
}

/// Hold manifests that share an image target with a building manifest.
///
/// A building manifest always holds itself.
pub fn hold_targets_with_building_components(state: &EngineState, holds: &mut HoldSet) {
  let mut building: BTreeSet<TargetId> = BTreeSet::new();
  for mt in state.targets().iter().filter(|mt| mt.state.is_building()) {
    building.insert(mt.manifest.id());
    for spec in mt.manifest.target_specs() {
      let id = spec.id();
      if id.kind != TargetKind::Image {
        continue;
      }
      let status = mt.state.build_status(&id).cloned().unwrap_or_default();
      if can_reuse_image_target_heuristic(spec, &status) {
        continue;
      }
      building.insert(id);
    }
  }

  for mt in state.targets() {
    let mut should_hold = building.contains(&mt.manifest.id());
    let mut hold_on = Vec::new();
    for image in mt.manifest.image_targets() {
      if building.contains(&image.id()) {
        hold_on.push(image.id());
        should_hold = true;
      }
    }
    if should_hold {
      holds.add_hold(mt.name(), Hold::on(HoldReason::BuildingComponent, hold_on));
    }
  }
}

/// An image target with a previous image result and no pending changes will
/// be reused, so it is not really "building".
pub fn can_reuse_image_target_heuristic(spec: &TargetSpec, status: &BuildStatus) -> bool {
  if spec.id().kind != TargetKind::Image {
    return false;
  }
  let reusable_result = matches!(
    status.last_result,
    Some(BuildResult::Image { .. } | BuildResult::LiveUpdate { .. })
  );
  reusable_result && !status.has_pending_file_changes() && !status.has_pending_dependency_changes()
}

/// Resource dependencies only gate the first build of a manifest.
pub fn waiting_on_dependencies(state: &EngineState, mt: &ManifestTarget) -> Vec<TargetId> {
  if mt.state.started_first_build() {
    return Vec::new();
  }
  mt.manifest
    .resource_dependencies
    .iter()
    .filter(|dep| {
      state
        .manifest_target(dep)
        .is_some_and(|dep_mt| !dep_mt.state.runtime.has_ever_been_ready())
    })
    .map(ManifestName::target_id)
    .collect()
}

fn hold_targets_waiting_on_dependencies(state: &EngineState, holds: &mut HoldSet) {
  for mt in state.targets() {
    let waiting = waiting_on_dependencies(state, mt);
    if !waiting.is_empty() {
      holds.add_hold(mt.name(), Hold::on(HoldReason::WaitingForDep, waiting));
    }
  }
}

fn hold_disabled_targets(targets: &[ManifestTarget], holds: &mut HoldSet) {
  for mt in targets.iter().filter(|mt| mt.state.is_disabled()) {
    holds.add_hold(mt.name(), Hold::new(HoldReason::Disabled));
  }
}

/// Local manifests first, then uncategorized YAML, then deploy-only
/// Kubernetes manifests, then whatever was declared first.
pub fn next_unbuilt_target_to_build<'a>(unbuilt: &[&'a ManifestTarget]) -> Option<&'a ManifestTarget> {
  unbuilt
    .iter()
    .find(|mt| mt.manifest.is_local())
    .or_else(|| unbuilt.iter().find(|mt| mt.manifest.is_unresourced_yaml()))
    .or_else(|| {
      unbuilt
        .iter()
        .find(|mt| mt.manifest.is_k8s() && mt.manifest.image_targets().next().is_none())
    })
    .or_else(|| unbuilt.first())
    .copied()
}

/// The auto-trigger manifest whose oldest pending change is the earliest.
/// Ties go to the manifest declared first.
pub fn earliest_pending_auto_trigger_target<'a>(targets: &[&'a ManifestTarget]) -> Option<&'a ManifestTarget> {
  let mut choice: Option<(&'a ManifestTarget, DateTime<Utc>)> = None;
  for &mt in targets {
    let Some(earliest) = mt.state.earliest_pending_change() else {
      continue;
    };
    if !mt.manifest.trigger_mode.auto_on_change() {
      continue;
    }
    // A manifest waiting for its first manual trigger does not build on change.
    if !mt.state.started_first_build() && !mt.manifest.trigger_mode.auto_initial() {
      continue;
    }
    match choice {
      Some((_, best)) if best <= earliest => {}
      _ => choice = Some((mt, earliest)),
    }
  }
  choice.map(|(mt, _)| mt)
}

/// Whether a manifest's pending changes could be live updated, but the
/// current deploy is not far enough along to receive them.
pub fn is_live_update_target_waiting_on_deploy(state: &EngineState, mt: &ManifestTarget) -> bool {
  if state.next_build_reason(mt) != BuildReason::CHANGED_FILES {
    return false;
  }
  if !mt.state.last_build().is_some_and(|b| b.succeeded()) {
    return false;
  }
  if mt.state.runtime.status == RuntimeStatus::Error {
    return false;
  }

  let mut waiting_images = Vec::new();
  for (id, status) in &mt.state.build_statuses {
    if !status.has_pending_file_changes() {
      continue;
    }
    let Some(image) = mt.manifest.image_target(id) else {
      return false;
    };
    if image.live_update.is_empty() {
      return false;
    }
    let files = status.pending_files();
    let Ok(plan) = plan_with(&image.live_update, &files, |_| Ok(false)) else {
      return false;
    };
    if !plan.is_live_updatable() {
      return false;
    }
    waiting_images.push(image);
  }
  if waiting_images.is_empty() {
    return false;
  }

  let runtime = &mt.state.runtime;
  if runtime.restarts() > 0 {
    return false;
  }

  if mt.manifest.is_docker_compose() {
    return !runtime.compose_container.as_ref().is_some_and(|c| c.running);
  }

  let Some(pod) = runtime.most_recent_pod() else {
    return true;
  };
  if pod.phase.is_completed() {
    return false;
  }
  pod.containers.iter().any(|c| {
    waiting_images
      .iter()
      .any(|image| matches_selector(&image.selector, &image.image_ref, c))
      && (c.id.is_none() || c.name.is_none() || !c.running)
  })
}

fn hold_live_update_targets_waiting_on_deploy(state: &EngineState, holds: &mut HoldSet) {
  for mt in state.targets() {
    if is_live_update_target_waiting_on_deploy(state, mt) {
      holds.add_hold(mt.name(), Hold::new(HoldReason::WaitingForDeploy));
    }
  }
}

/// Hold manifests whose changed images are all live updated by a healthy
/// reconciler.
fn hold_live_update_targets_handled_by_reconciler(state: &EngineState, holds: &mut HoldSet) {
  for mt in state.targets() {
    let reason = state.next_build_reason(mt);
    let live_update_eligible = if reason.has_trigger() {
      is_live_update_eligible_trigger(&mt.manifest, reason)
    } else {
      reason == BuildReason::CHANGED_FILES
    };
    if !live_update_eligible {
      continue;
    }

    if let Some(deploy) = mt.manifest.deploy_target()
      && mt
        .state
        .build_status(&deploy.id())
        .is_some_and(BuildStatus::has_pending_file_changes)
    {
      continue;
    }

    let handled = mt.manifest.image_targets().all(|image| {
      let id = image.id();
      if !mt.state.build_status(&id).is_some_and(BuildStatus::has_pending_file_changes) {
        return true;
      }
      image.live_update_reconciler && state.live_updates.get(&id).is_some_and(|lu| lu.failed.is_none())
    });
    if handled {
      holds.add_hold(mt.name(), Hold::new(HoldReason::Reconciling));
    }
  }
}
