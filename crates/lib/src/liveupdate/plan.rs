//! Deciding whether a set of changed files can be synced into a container.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::model::{LiveUpdateExec, LiveUpdateSpec};
use crate::util::ospath;

#[derive(Debug, Error)]
pub enum PlanError {
  #[error("failed to stat sync path {path}")]
  Stat {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// A local file and where it lands in the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathMapping {
  pub local_path: PathBuf,
  pub container_path: String,
}

/// A command to run inside each updated container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cmd {
  pub argv: Vec<String>,
}

impl Cmd {
  pub fn new<S: Into<String>>(argv: impl IntoIterator<Item = S>) -> Self {
    Self {
      argv: argv.into_iter().map(Into::into).collect(),
    }
  }
}

impl std::fmt::Display for Cmd {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.argv.join(" "))
  }
}

/// How one set of changed files maps onto a live update spec.
///
/// `sync_paths`, `no_match_paths` and `fall_back_paths` are computed
/// independently: a file can both sync and trigger a fall back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiveUpdatePlan {
  pub sync_paths: Vec<PathMapping>,
  pub no_match_paths: Vec<PathBuf>,
  pub fall_back_paths: Vec<PathBuf>,
  /// Exec steps whose triggers matched a synced file, in declared order.
  pub run_steps: Vec<Cmd>,
}

impl LiveUpdatePlan {
  /// Every changed file is covered by a sync and none forces a rebuild.
  pub fn is_live_updatable(&self) -> bool {
    self.no_match_paths.is_empty() && self.fall_back_paths.is_empty()
  }
}

/// Build a plan, checking the filesystem for sync roots that are files.
pub fn plan(spec: &LiveUpdateSpec, changed_files: &[PathBuf]) -> Result<LiveUpdatePlan, PlanError> {
  plan_with(spec, changed_files, is_file)
}

/// Build a plan with a caller-supplied check for "this sync root is a file".
///
/// The scheduler passes a check that always answers `false` so planning stays
/// free of I/O; the container path is only affected for file roots synced into
/// a directory.
pub fn plan_with<F>(spec: &LiveUpdateSpec, changed_files: &[PathBuf], mut is_file: F) -> Result<LiveUpdatePlan, PlanError>
where
  F: FnMut(&Path) -> io::Result<bool>,
{
  let mut plan = LiveUpdatePlan::default();

  for file in changed_files {
    match map_file(spec, file, &mut is_file)? {
      Some(mapping) => plan.sync_paths.push(mapping),
      None => plan.no_match_paths.push(file.clone()),
    }

    let falls_back = spec
      .fall_back_on
      .iter()
      .any(|p| ospath::is_child(&resolve(&spec.base_path, p), file));
    if falls_back {
      plan.fall_back_paths.push(file.clone());
    }
  }

  plan.run_steps = boil_runs(&spec.base_path, &spec.execs, &plan.sync_paths);
  Ok(plan)
}

fn map_file<F>(spec: &LiveUpdateSpec, file: &Path, is_file: &mut F) -> Result<Option<PathMapping>, PlanError>
where
  F: FnMut(&Path) -> io::Result<bool>,
{
  for sync in &spec.syncs {
    let local_root = resolve(&spec.base_path, &sync.local_path);
    let Some(rel) = ospath::child(&local_root, file) else {
      continue;
    };

    let root_is_file = is_file(&local_root).map_err(|source| PlanError::Stat {
      path: local_root.clone(),
      source,
    })?;

    let container_path = if root_is_file && sync.container_path.ends_with('/') {
      ospath::join_container_path(&sync.container_path, Path::new(&ospath::base_name(&local_root)))
    } else {
      ospath::join_container_path(&sync.container_path, &rel)
    };

    return Ok(Some(PathMapping {
      local_path: file.to_path_buf(),
      container_path,
    }));
  }
  Ok(None)
}

/// The exec steps that should run for these synced files.
///
/// A step with no triggers always runs. A step with triggers runs when at
/// least one synced local path is at or under one of them.
pub fn boil_runs(base_path: &Path, execs: &[LiveUpdateExec], mappings: &[PathMapping]) -> Vec<Cmd> {
  execs
    .iter()
    .filter(|exec| {
      exec.trigger_paths.is_empty()
        || exec.trigger_paths.iter().any(|trigger| {
          let trigger = resolve(base_path, trigger);
          mappings.iter().any(|m| ospath::is_child(&trigger, &m.local_path))
        })
    })
    .map(|exec| Cmd::new(exec.args.iter().cloned()))
    .collect()
}

/// Split mappings into files to delete in the container (gone locally) and
/// files to copy.
pub fn missing_local_paths(mappings: &[PathMapping]) -> (Vec<PathMapping>, Vec<PathMapping>) {
  missing_local_paths_with(mappings, |p| p.exists())
}

pub fn missing_local_paths_with<F>(mappings: &[PathMapping], mut exists: F) -> (Vec<PathMapping>, Vec<PathMapping>)
where
  F: FnMut(&Path) -> bool,
{
  mappings.iter().cloned().partition(|m| !exists(&m.local_path))
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
  if path.is_absolute() || base.as_os_str().is_empty() {
    path.to_path_buf()
  } else {
    base.join(path)
  }
}

fn is_file(path: &Path) -> io::Result<bool> {
  match std::fs::metadata(path) {
    Ok(meta) => Ok(meta.is_file()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
    Err(e) => Err(e),
  }
}
