//! Implementation of the `devloop order` command.
//!
//! Shows the order a manifest's targets would build in and which of them
//! would be reused from their previous result.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;

use devloop_lib::buildcontrol::{CollaboratorError, ImageChecker, TargetQueue};
use devloop_lib::model::ManifestName;

use super::load_state;
use crate::output::{OutputFormat, print_info, print_item, print_json, symbols};

/// Answers existence checks from the `images` list of the state file.
struct KnownImages(Option<BTreeSet<String>>);

#[async_trait]
impl ImageChecker for KnownImages {
  async fn image_exists(&self, image_ref: &str) -> Result<bool, CollaboratorError> {
    Ok(self.0.as_ref().is_none_or(|images| images.contains(image_ref)))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
enum Action {
  Build,
  RebuildForDeps,
  Reuse,
}

impl Action {
  fn describe(self) -> &'static str {
    match self {
      Action::Build => "build",
      Action::RebuildForDeps => "build, dependency changed",
      Action::Reuse => "reuse",
    }
  }
}

#[derive(Debug, Serialize)]
struct Step {
  target: String,
  action: Action,
}

pub fn cmd_order(state_path: &Path, manifest: &str, output: OutputFormat) -> Result<()> {
  let file = load_state(state_path)?;
  let mt = file
    .state
    .manifest_target(&ManifestName::new(manifest))
    .ok_or_else(|| anyhow!("No manifest named '{}' in {}", manifest, state_path.display()))?;

  let build_state = file.state.build_state_set_for(mt);
  let checker = KnownImages(file.images.clone().map(|images| images.into_iter().collect()));

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let queue = rt
    .block_on(TargetQueue::new(&mt.manifest.targets, build_state, &checker))
    .with_context(|| format!("Failed to order targets of {}", manifest))?;

  let steps: Vec<Step> = queue
    .sorted_targets()
    .iter()
    .map(|spec| {
      let id = spec.id();
      let action = if queue.deps_need_build(&id) {
        Action::RebuildForDeps
      } else if queue.needs_own_build(&id) {
        Action::Build
      } else {
        Action::Reuse
      };
      Step {
        target: id.to_string(),
        action,
      }
    })
    .collect();

  if output.is_json() {
    return print_json(&steps);
  }

  if steps.is_empty() {
    print_info(&format!("{} has no targets", manifest));
    return Ok(());
  }
  print_info(&format!("Build order for {}:", manifest));
  for step in &steps {
    let marker = match step.action {
      Action::Reuse => symbols::TILDE,
      Action::Build | Action::RebuildForDeps => symbols::PLUS,
    };
    print_item(marker, &step.target, Some(step.action.describe()));
  }
  Ok(())
}
