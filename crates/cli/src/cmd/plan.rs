//! Implementation of the `devloop plan` command.
//!
//! Computes the live-update plan an image target would use for a set of
//! changed files, without touching any container.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;

use devloop_lib::config::EngineConfig;
use devloop_lib::liveupdate::{LiveUpdatePlan, PathMapping, missing_local_paths, plan};
use devloop_lib::model::{TargetId, TargetKind};

use super::load_state;
use crate::output::{OutputFormat, print_info, print_item, print_json, print_success, print_warning, symbols};

#[derive(Debug, Serialize)]
struct PlanOutput {
  target: String,
  live_updatable: bool,
  copy: Vec<PathMapping>,
  remove: Vec<PathMapping>,
  #[serde(flatten)]
  plan: LiveUpdatePlan,
}

pub fn cmd_plan(
  state_path: &Path,
  target: &str,
  files: &[PathBuf],
  config: &EngineConfig,
  output: OutputFormat,
) -> Result<()> {
  let id: TargetId = target.parse().with_context(|| format!("Invalid target id: {}", target))?;
  if id.kind != TargetKind::Image {
    bail!("{} is not an image target", id);
  }

  let file = load_state(state_path)?;
  let image = file
    .state
    .targets()
    .iter()
    .find_map(|mt| mt.manifest.image_target(&id))
    .ok_or_else(|| anyhow!("No image target {} in {}", id, state_path.display()))?;

  let plan = plan(&image.live_update, files).with_context(|| format!("Failed to plan live update for {}", id))?;
  let (remove, copy) = missing_local_paths(&plan.sync_paths);
  let result = PlanOutput {
    target: id.to_string(),
    live_updatable: config.live_update_enabled && !image.live_update.is_empty() && plan.is_live_updatable(),
    copy,
    remove,
    plan,
  };

  if output.is_json() {
    return print_json(&result);
  }

  if !config.live_update_enabled {
    print_warning("Live update is disabled in the engine config");
  }
  if result.live_updatable {
    print_success(&format!("{} can be live updated", result.target));
  } else {
    print_info(&format!("{} needs a full build", result.target));
  }

  for mapping in &result.copy {
    let text = format!("{} -> {}", mapping.local_path.display(), mapping.container_path);
    print_item(symbols::PLUS, &text, None);
  }
  for mapping in &result.remove {
    print_item(symbols::MINUS, &mapping.container_path, Some("deleted locally"));
  }
  for path in &result.plan.no_match_paths {
    print_item(symbols::WARNING, &path.display().to_string(), Some("not covered by any sync"));
  }
  for path in &result.plan.fall_back_paths {
    print_item(symbols::WARNING, &path.display().to_string(), Some("forces a full build"));
  }
  for cmd in &result.plan.run_steps {
    print_item(symbols::ARROW, &cmd.to_string(), Some("run"));
  }
  Ok(())
}
