//! Fixtures and fake collaborators shared by the unit tests.
//!
//! Image fixtures use `registry/<name>` as their image reference.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::buildcontrol::{BuildError, CollaboratorError, ContainerUpdater, ImageChecker, TargetBuilder};
use crate::liveupdate::{Cmd, Container, PathMapping};
use crate::model::{
  ImageTarget, K8sTarget, LiveUpdateSpec, LiveUpdateSync, LocalTarget, Manifest, ManifestName, TargetId, TargetSpec,
};
use crate::store::{BuildReason, BuildRecord, BuildResult, BuildState, EngineState};

/// A timestamp `secs` seconds after the epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
  Utc.timestamp_opt(secs, 0).single().unwrap()
}

fn ids(deps: &[&str]) -> Vec<TargetId> {
  deps.iter().map(|d| d.parse().unwrap()).collect()
}

pub fn image(name: &str, deps: &[&str]) -> TargetSpec {
  TargetSpec::Image(ImageTarget {
    name: name.to_string(),
    image_ref: format!("registry/{name}"),
    dependencies: ids(deps),
    live_update: LiveUpdateSpec::default(),
    selector: Default::default(),
    live_update_only: false,
    live_update_reconciler: false,
  })
}

/// An image that syncs `local` into `container` on change.
pub fn image_with_sync(name: &str, local: &str, container: &str) -> TargetSpec {
  let mut spec = image(name, &[]);
  if let TargetSpec::Image(image) = &mut spec {
    image.live_update = LiveUpdateSpec {
      base_path: PathBuf::from("/"),
      syncs: vec![LiveUpdateSync {
        local_path: PathBuf::from(local),
        container_path: container.to_string(),
      }],
      ..Default::default()
    };
  }
  spec
}

pub fn k8s(name: &str, deps: &[&str]) -> TargetSpec {
  TargetSpec::K8s(K8sTarget {
    name: name.to_string(),
    dependencies: ids(deps),
    entities: vec![format!("deployment/{name}")],
  })
}

/// A Kubernetes manifest deploying every image in `images`.
pub fn k8s_manifest(name: &str, images: Vec<TargetSpec>) -> Manifest {
  let deps: Vec<String> = images.iter().map(|i| i.id().to_string()).collect();
  let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
  let deploy = k8s(name, &deps);
  images
    .into_iter()
    .fold(Manifest::new(name), Manifest::with_target)
    .with_target(deploy)
}

pub fn local_manifest(name: &str, allow_parallel: bool) -> Manifest {
  Manifest::new(name).with_target(TargetSpec::Local(LocalTarget {
    name: name.to_string(),
    cmd: vec!["make".to_string(), name.to_string()],
    dependencies: vec![],
    allow_parallel,
  }))
}

pub fn image_result(name: &str, image_ref: &str) -> BuildResult {
  BuildResult::Image {
    target: TargetId::image(name),
    image_ref: image_ref.to_string(),
  }
}

pub fn container(id: &str) -> Container {
  Container {
    pod_name: Some("web-1".to_string()),
    namespace: Some("default".to_string()),
    container_id: id.to_string(),
    container_name: "web".to_string(),
  }
}

/// Record a finished, successful build for manifest `name`.
pub fn mark_built(state: &mut EngineState, name: &str, time: DateTime<Utc>) {
  let mt = state.manifest_target_mut(&ManifestName::new(name)).unwrap();
  let mut record = BuildRecord::started(time, BuildReason::INIT, vec![]);
  record.finish_time = Some(time);
  mt.state.build_history.insert(0, record);
}

pub fn pend_file(state: &mut EngineState, name: &str, target: TargetId, path: &str, time: DateTime<Utc>) {
  let mt = state.manifest_target_mut(&ManifestName::new(name)).unwrap();
  mt.state
    .build_status_mut(&target)
    .pending_file_changes
    .insert(PathBuf::from(path), time);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCall {
  pub target: TargetId,
  pub files_changed: Vec<PathBuf>,
  pub state_was_empty: bool,
  pub dependency_results: Vec<BuildResult>,
}

/// Builds every target successfully unless told otherwise, recording each
/// call in order.
#[derive(Default)]
pub struct FakeBuilder {
  failing: BTreeSet<TargetId>,
  canceling: BTreeSet<TargetId>,
  calls: Mutex<Vec<BuildCall>>,
}

impl FakeBuilder {
  pub fn failing(targets: &[TargetId]) -> Self {
    Self {
      failing: targets.iter().cloned().collect(),
      ..Default::default()
    }
  }

  pub fn canceling(targets: &[TargetId]) -> Self {
    Self {
      canceling: targets.iter().cloned().collect(),
      ..Default::default()
    }
  }

  pub fn calls(&self) -> Vec<BuildCall> {
    self.calls.lock().clone()
  }
}

#[async_trait]
impl TargetBuilder for FakeBuilder {
  async fn build(
    &self,
    spec: &TargetSpec,
    state: &BuildState,
    dependency_results: &[BuildResult],
  ) -> Result<BuildResult, BuildError> {
    let id = spec.id();
    self.calls.lock().push(BuildCall {
      target: id.clone(),
      files_changed: state.files_changed(),
      state_was_empty: state.is_empty(),
      dependency_results: dependency_results.to_vec(),
    });

    if self.canceling.contains(&id) {
      return Err(BuildError::Canceled);
    }
    if self.failing.contains(&id) {
      return Err(BuildError::Failed(format!("{id} failed to build")));
    }

    Ok(match spec {
      TargetSpec::Image(image) => BuildResult::Image {
        target: id,
        image_ref: format!("{}:built", image.image_ref),
      },
      TargetSpec::K8s(k8s) => BuildResult::K8sDeploy {
        target: id,
        applied_entities: k8s.entities.clone(),
      },
      TargetSpec::DockerCompose(_) => BuildResult::DockerCompose {
        target: id,
        container_id: Some("compose-1".to_string()),
      },
      TargetSpec::Local(_) => BuildResult::LocalExec { target: id },
    })
  }
}

enum Presence {
  All,
  Only(BTreeSet<String>),
  Failing(String),
}

pub struct FakeImageChecker {
  presence: Presence,
  checked: Mutex<Vec<String>>,
}

impl FakeImageChecker {
  fn with(presence: Presence) -> Self {
    Self {
      presence,
      checked: Mutex::new(Vec::new()),
    }
  }

  pub fn all_present() -> Self {
    Self::with(Presence::All)
  }

  pub fn present(refs: &[&str]) -> Self {
    Self::with(Presence::Only(refs.iter().map(|r| r.to_string()).collect()))
  }

  pub fn failing(message: &str) -> Self {
    Self::with(Presence::Failing(message.to_string()))
  }

  pub fn checked(&self) -> Vec<String> {
    self.checked.lock().clone()
  }
}

#[async_trait]
impl ImageChecker for FakeImageChecker {
  async fn image_exists(&self, image_ref: &str) -> Result<bool, CollaboratorError> {
    self.checked.lock().push(image_ref.to_string());
    match &self.presence {
      Presence::All => Ok(true),
      Presence::Only(refs) => Ok(refs.contains(image_ref)),
      Presence::Failing(message) => Err(message.clone().into()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdaterCall {
  Remove { container: String, paths: Vec<String> },
  Copy { container: String, files: Vec<PathMapping> },
  Exec { container: String, argv: Vec<String> },
  Restart { container: String },
}

/// Records container updates; exec exits 1 in the configured containers.
#[derive(Default)]
pub struct FakeContainerUpdater {
  failing_exec: BTreeSet<String>,
  calls: Mutex<Vec<UpdaterCall>>,
}

impl FakeContainerUpdater {
  pub fn failing_exec_in(container_ids: &[&str]) -> Self {
    Self {
      failing_exec: container_ids.iter().map(|c| c.to_string()).collect(),
      ..Default::default()
    }
  }

  pub fn calls(&self) -> Vec<UpdaterCall> {
    self.calls.lock().clone()
  }
}

#[async_trait]
impl ContainerUpdater for FakeContainerUpdater {
  async fn remove_files(&self, container: &Container, paths: &[String]) -> Result<(), CollaboratorError> {
    self.calls.lock().push(UpdaterCall::Remove {
      container: container.container_id.clone(),
      paths: paths.to_vec(),
    });
    Ok(())
  }

  async fn copy_files(&self, container: &Container, files: &[PathMapping]) -> Result<(), CollaboratorError> {
    self.calls.lock().push(UpdaterCall::Copy {
      container: container.container_id.clone(),
      files: files.to_vec(),
    });
    Ok(())
  }

  async fn exec(&self, container: &Container, cmd: &Cmd) -> Result<i32, CollaboratorError> {
    self.calls.lock().push(UpdaterCall::Exec {
      container: container.container_id.clone(),
      argv: cmd.argv.clone(),
    });
    Ok(if self.failing_exec.contains(&container.container_id) { 1 } else { 0 })
  }

  async fn restart(&self, container: &Container) -> Result<(), CollaboratorError> {
    self.calls.lock().push(UpdaterCall::Restart {
      container: container.container_id.clone(),
    });
    Ok(())
  }
}
