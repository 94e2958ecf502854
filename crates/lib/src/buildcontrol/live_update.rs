//! Build strategy that patches running containers instead of rebuilding.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::BuildAndDeployer;
use super::errors::{BuildError, CollaboratorError};
use crate::config::UpdateMode;
use crate::liveupdate::{Cmd, Container, LiveUpdatePlan, PathMapping, missing_local_paths, plan};
use crate::model::{ImageTarget, TargetGraph, TargetSpec};
use crate::store::{BuildResult, BuildResultSet, BuildStateSet};
use crate::util::ospath::format_file_change_list;

/// Moves files into and runs commands inside a running container.
#[async_trait]
pub trait ContainerUpdater: Send + Sync {
  async fn remove_files(&self, container: &Container, paths: &[String]) -> Result<(), CollaboratorError>;

  async fn copy_files(&self, container: &Container, files: &[PathMapping]) -> Result<(), CollaboratorError>;

  /// Run a command to completion and return its exit code.
  async fn exec(&self, container: &Container, cmd: &Cmd) -> Result<i32, CollaboratorError>;

  async fn restart(&self, container: &Container) -> Result<(), CollaboratorError>;
}

/// An image target that can be live updated, with everything needed to do it.
#[derive(Debug, Clone)]
pub struct LiveUpdateTarget {
  pub image: ImageTarget,
  pub files_changed: Vec<PathBuf>,
  pub containers: Vec<Container>,
  pub image_ref: Option<String>,
}

/// Pick out the deployed image targets that a live update could serve.
///
/// Any condition that rules out a live update is returned as a redirect so
/// the caller can move on to a full build.
pub fn extract_live_update_targets(
  specs: &[TargetSpec],
  state: &BuildStateSet,
) -> Result<Vec<LiveUpdateTarget>, BuildError> {
  let graph = TargetGraph::new(specs)?;
  if !graph.is_single_source_dag() {
    return Err(BuildError::silent_redirect(
      "cannot live update this build graph: it has more than one deploy target",
    ));
  }

  for spec in specs.iter().filter(|s| s.as_image().is_none()) {
    if state.get(&spec.id()).is_some_and(|s| !s.files_changed.is_empty()) {
      return Err(BuildError::silent_redirect(format!(
        "changes to {} can only be applied by redeploying",
        spec.id()
      )));
    }
  }

  let mut targets = Vec::new();
  for image in graph.deployed_images() {
    let id = image.id();
    let Some(image_state) = state.get(&id).filter(|s| !s.is_empty()) else {
      return Err(BuildError::silent_redirect("live update does not support the initial deploy"));
    };
    if image_state.full_build_triggered {
      return Err(BuildError::silent_redirect("full build triggered manually"));
    }

    let tree = graph.tree(&id);
    let files_changed: Vec<PathBuf> = {
      let mut files: Vec<PathBuf> = tree
        .iter()
        .filter_map(|spec| state.get(&spec.id()))
        .flat_map(|s| s.files_changed.iter().cloned())
        .collect();
      files.sort();
      files.dedup();
      files
    };
    if files_changed.is_empty() {
      continue;
    }
    if !image_state.deps_changed.is_empty() {
      return Err(BuildError::silent_redirect(format!("{id} has pending dependency changes")));
    }
    if image.live_update.is_empty() {
      return Err(BuildError::silent_redirect(format!("{id} has no live update rules")));
    }
    if image.live_update_reconciler {
      return Err(BuildError::silent_redirect(format!(
        "live update for {id} is handled by a reconciler"
      )));
    }
    if let Some(err) = &image_state.running_containers_error {
      return Err(BuildError::info_redirect(format!(
        "error retrieving container info for {id}: {err}"
      )));
    }
    if image_state.running_containers.is_empty() {
      return Err(BuildError::info_redirect(format!(
        "no running container found for image {} (often the deployment is not ready yet)",
        image.image_ref
      )));
    }

    targets.push(LiveUpdateTarget {
      image_ref: image_state.last_result.as_ref().and_then(|r| r.image_ref().map(String::from)),
      containers: image_state.running_containers.clone(),
      image,
      files_changed,
    });
  }
  Ok(targets)
}

pub struct LiveUpdateBuildAndDeployer {
  /// Copies via the container runtime (docker cp/exec).
  runtime_updater: Arc<dyn ContainerUpdater>,
  /// Copies via exec into the container (kubectl exec).
  exec_updater: Arc<dyn ContainerUpdater>,
  mode: UpdateMode,
  enabled: bool,
}

impl LiveUpdateBuildAndDeployer {
  pub fn new(runtime_updater: Arc<dyn ContainerUpdater>, exec_updater: Arc<dyn ContainerUpdater>) -> Self {
    Self {
      runtime_updater,
      exec_updater,
      mode: UpdateMode::Auto,
      enabled: true,
    }
  }

  pub fn with_mode(mut self, mode: UpdateMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  fn updater_for(&self, specs: &[TargetSpec]) -> &Arc<dyn ContainerUpdater> {
    let compose = specs.iter().any(|s| matches!(s, TargetSpec::DockerCompose(_)));
    match self.mode {
      UpdateMode::Container => &self.runtime_updater,
      UpdateMode::Exec => &self.exec_updater,
      UpdateMode::Auto if compose => &self.runtime_updater,
      UpdateMode::Auto => &self.exec_updater,
    }
  }
}

/// Apply one plan to every container of a target.
///
/// A user command failing in one container does not stop the others. If a
/// later container then succeeds, the containers disagree and the error
/// asks for a full build.
async fn update_containers(
  updater: &dyn ContainerUpdater,
  target: &LiveUpdateTarget,
  plan: &LiveUpdatePlan,
) -> Result<BuildResult, BuildError> {
  let (to_remove, to_copy) = missing_local_paths(&plan.sync_paths);
  let remove_paths: Vec<String> = to_remove.iter().map(|m| m.container_path.clone()).collect();
  let restart = target.image.live_update.restart;

  let mut last_user_failure: Option<BuildError> = None;
  let mut updated = Vec::new();

  for container in &target.containers {
    info!(
      container = %container.display_name(),
      files = %format_file_change_list(&target.files_changed),
      "updating container"
    );
    match update_container(updater, container, &remove_paths, &to_copy, &plan.run_steps, restart).await {
      Ok(()) => {
        if let Some(failure) = &last_user_failure {
          return Err(BuildError::InconsistentState(format!(
            "container {} updated but an earlier container failed ({failure}); containers are now out of sync",
            container.display_name()
          )));
        }
        updated.push(container.container_id.clone());
      }
      Err(e @ BuildError::RunStepFailure { .. }) => {
        warn!(container = %container.display_name(), error = %e, "command failed in container");
        last_user_failure = Some(e);
      }
      Err(e) => return Err(e),
    }
  }

  if let Some(failure) = last_user_failure {
    return Err(BuildError::dont_fall_back(failure));
  }

  Ok(BuildResult::LiveUpdate {
    target: target.image.id(),
    image_ref: target.image_ref.clone(),
    container_ids: updated,
  })
}

async fn update_container(
  updater: &dyn ContainerUpdater,
  container: &Container,
  remove_paths: &[String],
  to_copy: &[PathMapping],
  run_steps: &[Cmd],
  restart: bool,
) -> Result<(), BuildError> {
  if !remove_paths.is_empty() {
    updater
      .remove_files(container, remove_paths)
      .await
      .map_err(|e| BuildError::infrastructure(format!("removing files from {}", container.display_name()), e))?;
  }
  if !to_copy.is_empty() {
    updater
      .copy_files(container, to_copy)
      .await
      .map_err(|e| BuildError::infrastructure(format!("copying files to {}", container.display_name()), e))?;
  }

  for cmd in run_steps {
    debug!(container = %container.display_name(), cmd = %cmd, "running update step");
    let exit_code = updater
      .exec(container, cmd)
      .await
      .map_err(|e| BuildError::infrastructure(format!("running {cmd} in {}", container.display_name()), e))?;
    if exit_code != 0 {
      return Err(BuildError::RunStepFailure {
        container: container.display_name(),
        cmd: cmd.to_string(),
        exit_code,
      });
    }
  }

  if restart {
    updater
      .restart(container)
      .await
      .map_err(|e| BuildError::infrastructure(format!("restarting {}", container.display_name()), e))?;
  }
  Ok(())
}

#[async_trait]
impl BuildAndDeployer for LiveUpdateBuildAndDeployer {
  fn name(&self) -> &'static str {
    "live-update"
  }

  async fn build_and_deploy(&self, specs: &[TargetSpec], state: &BuildStateSet) -> Result<BuildResultSet, BuildError> {
    if !self.enabled {
      return Err(BuildError::silent_redirect("live update is disabled"));
    }

    let targets = extract_live_update_targets(specs, state)?;
    if targets.is_empty() {
      return Err(BuildError::silent_redirect("no targets for live update found"));
    }

    let mut plans = Vec::with_capacity(targets.len());
    for target in &targets {
      let plan = plan(&target.image.live_update, &target.files_changed)?;
      if !plan.fall_back_paths.is_empty() {
        return Err(BuildError::info_redirect(format!(
          "detected change to fall_back_on file {}",
          format_file_change_list(&plan.fall_back_paths)
        )));
      }
      if !plan.no_match_paths.is_empty() {
        return Err(BuildError::info_redirect(format!(
          "found file(s) not matching any sync for {}: {}",
          target.image.id(),
          format_file_change_list(&plan.no_match_paths)
        )));
      }
      plans.push(plan);
    }

    let updater = self.updater_for(specs);
    let mut results = BuildResultSet::new();
    // A user command failure in one image still lets the other images update,
    // so every container ends up with the same files.
    let mut user_failure: Option<BuildError> = None;
    for (target, plan) in targets.iter().zip(&plans) {
      match update_containers(updater.as_ref(), target, plan).await {
        Ok(result) => {
          results.insert(target.image.id(), result);
        }
        Err(e) if e.is_dont_fall_back() && !e.is_fatal() => {
          warn!(target = %target.image.id(), error = %e, "live update failed, continuing with remaining images");
          user_failure = Some(e);
        }
        Err(e) => return Err(e),
      }
    }
    match user_failure {
      Some(e) => Err(e),
      None => Ok(results),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buildcontrol::RedirectLevel;
  use crate::model::{LiveUpdateExec, TargetId};
  use crate::store::BuildState;
  use crate::util::testutil::{
    FakeContainerUpdater, UpdaterCall, container, image_result, image_with_sync, k8s_manifest,
  };

  fn web_specs() -> Vec<TargetSpec> {
    k8s_manifest("web", vec![image_with_sync("web", "/app", "/src")]).targets
  }

  fn with_make(mut spec: TargetSpec) -> TargetSpec {
    if let TargetSpec::Image(image) = &mut spec {
      image.live_update.execs.push(LiveUpdateExec {
        args: vec!["make".to_string()],
        trigger_paths: vec![],
      });
    }
    spec
  }

  fn web_specs_with_make() -> Vec<TargetSpec> {
    k8s_manifest("web", vec![with_make(image_with_sync("web", "/app", "/src"))]).targets
  }

  fn deployed_web() -> BuildState {
    BuildState::new(
      Some(BuildResult::K8sDeploy {
        target: TargetId::k8s("web"),
        applied_entities: vec!["deployment/web".to_string()],
      }),
      [],
    )
  }

  fn state_with(files: &[&str], containers: Vec<Container>) -> BuildStateSet {
    let mut state = BuildStateSet::new();
    state.insert(
      TargetId::image("web"),
      BuildState::new(
        Some(image_result("web", "registry/web:dev-1")),
        files.iter().map(PathBuf::from),
      )
      .with_running_containers(containers),
    );
    state.insert(TargetId::k8s("web"), deployed_web());
    state
  }

  fn live_update_bad(updater: FakeContainerUpdater) -> (LiveUpdateBuildAndDeployer, Arc<FakeContainerUpdater>) {
    let updater = Arc::new(updater);
    let bad = LiveUpdateBuildAndDeployer::new(updater.clone(), updater.clone());
    (bad, updater)
  }

  #[tokio::test]
  async fn syncs_files_and_reports_live_update_result() {
    let dir = tempfile::tempdir().unwrap();
    let app = dir.path().join("app");
    std::fs::create_dir(&app).unwrap();
    std::fs::write(app.join("main.py"), "print()").unwrap();

    let specs = k8s_manifest("web", vec![image_with_sync("web", app.to_str().unwrap(), "/src")]).targets;
    let (bad, updater) = live_update_bad(FakeContainerUpdater::default());
    let mut state = BuildStateSet::new();
    state.insert(
      TargetId::image("web"),
      BuildState::new(
        Some(image_result("web", "registry/web:dev-1")),
        [app.join("main.py"), app.join("gone.py")],
      )
      .with_running_containers(vec![container("c1")]),
    );
    state.insert(TargetId::k8s("web"), deployed_web());

    let results = bad.build_and_deploy(&specs, &state).await.unwrap();
    assert_eq!(
      results[&TargetId::image("web")],
      BuildResult::LiveUpdate {
        target: TargetId::image("web"),
        image_ref: Some("registry/web:dev-1".to_string()),
        container_ids: vec!["c1".to_string()],
      }
    );
    // Deleted locally, so removed in the container; the rest is copied.
    assert_eq!(
      updater.calls(),
      vec![
        UpdaterCall::Remove {
          container: "c1".to_string(),
          paths: vec!["/src/gone.py".to_string()],
        },
        UpdaterCall::Copy {
          container: "c1".to_string(),
          files: vec![PathMapping {
            local_path: app.join("main.py"),
            container_path: "/src/main.py".to_string(),
          }],
        },
      ]
    );
  }

  #[tokio::test]
  async fn initial_deploy_redirects_silently() {
    let (bad, _) = live_update_bad(FakeContainerUpdater::default());
    let mut state = state_with(&["/app/main.py"], vec![container("c1")]);
    state.insert(TargetId::image("web"), BuildState::default());

    let err = bad.build_and_deploy(&web_specs(), &state).await.unwrap_err();
    assert!(matches!(
      err,
      BuildError::Redirect {
        level: RedirectLevel::Debug,
        ..
      }
    ));
  }

  #[tokio::test]
  async fn no_containers_redirects_with_info() {
    let (bad, _) = live_update_bad(FakeContainerUpdater::default());
    let state = state_with(&["/app/main.py"], vec![]);

    let err = bad.build_and_deploy(&web_specs(), &state).await.unwrap_err();
    assert!(matches!(
      err,
      BuildError::Redirect {
        level: RedirectLevel::Info,
        ..
      }
    ));
  }

  #[tokio::test]
  async fn unmatched_file_redirects() {
    let (bad, updater) = live_update_bad(FakeContainerUpdater::default());
    let state = state_with(&["/app/main.py", "/lib/y.py"], vec![container("c1")]);

    let err = bad.build_and_deploy(&web_specs(), &state).await.unwrap_err();
    assert!(err.is_redirect());
    assert!(err.to_string().contains("/lib/y.py"));
    assert!(updater.calls().is_empty());
  }

  #[tokio::test]
  async fn full_build_trigger_redirects() {
    let (bad, _) = live_update_bad(FakeContainerUpdater::default());
    let mut state = state_with(&["/app/main.py"], vec![container("c1")]);
    let web = state.remove(&TargetId::image("web")).unwrap().with_full_build_triggered(true);
    state.insert(TargetId::image("web"), web);

    let err = bad.build_and_deploy(&web_specs(), &state).await.unwrap_err();
    assert!(err.is_redirect());
  }

  #[tokio::test]
  async fn deploy_config_change_redirects() {
    let (bad, _) = live_update_bad(FakeContainerUpdater::default());
    let mut state = state_with(&["/app/main.py"], vec![container("c1")]);
    state.get_mut(&TargetId::k8s("web")).unwrap().files_changed.insert(PathBuf::from("/k8s/web.yaml"));

    let err = bad.build_and_deploy(&web_specs(), &state).await.unwrap_err();
    assert!(err.is_redirect());
  }

  #[tokio::test]
  async fn user_command_failure_continues_then_does_not_fall_back() {
    let specs = web_specs_with_make();
    let (bad, updater) = live_update_bad(FakeContainerUpdater::failing_exec_in(&["c1", "c2"]));
    let state = state_with(&["/app/main.py"], vec![container("c1"), container("c2")]);

    let err = bad.build_and_deploy(&specs, &state).await.unwrap_err();
    assert!(err.is_dont_fall_back());
    assert!(!err.should_fall_back());

    // Both containers were attempted.
    let execs: Vec<_> = updater
      .calls()
      .into_iter()
      .filter(|c| matches!(c, UpdaterCall::Exec { .. }))
      .collect();
    assert_eq!(execs.len(), 2);
  }

  #[tokio::test]
  async fn user_failure_in_one_image_still_updates_the_others() {
    let specs = k8s_manifest(
      "web",
      vec![
        with_make(image_with_sync("a", "/a", "/src/a")),
        with_make(image_with_sync("b", "/b", "/src/b")),
      ],
    )
    .targets;
    let (bad, updater) = live_update_bad(FakeContainerUpdater::failing_exec_in(&["ca"]));
    let mut state = BuildStateSet::new();
    for (name, container_id) in [("a", "ca"), ("b", "cb")] {
      state.insert(
        TargetId::image(name),
        BuildState::new(
          Some(image_result(name, &format!("registry/{name}:dev-1"))),
          [PathBuf::from(format!("/{name}/main.py"))],
        )
        .with_running_containers(vec![container(container_id)]),
      );
    }
    state.insert(TargetId::k8s("web"), deployed_web());

    let err = bad.build_and_deploy(&specs, &state).await.unwrap_err();
    assert!(err.is_dont_fall_back());
    assert!(matches!(err, BuildError::DontFallBack(ref inner) if inner.to_string().contains("make")));

    let execs: Vec<String> = updater
      .calls()
      .into_iter()
      .filter_map(|c| match c {
        UpdaterCall::Exec { container, .. } => Some(container),
        _ => None,
      })
      .collect();
    assert_eq!(execs, vec!["ca".to_string(), "cb".to_string()]);
  }

  #[tokio::test]
  async fn success_after_user_failure_is_inconsistent() {
    let specs = web_specs_with_make();
    let (bad, _) = live_update_bad(FakeContainerUpdater::failing_exec_in(&["c1"]));
    let state = state_with(&["/app/main.py"], vec![container("c1"), container("c2")]);

    let err = bad.build_and_deploy(&specs, &state).await.unwrap_err();
    assert!(matches!(err, BuildError::InconsistentState(_)));
    assert!(err.should_fall_back());
  }

  #[tokio::test]
  async fn disabled_live_update_redirects() {
    let updater = Arc::new(FakeContainerUpdater::default());
    let bad = LiveUpdateBuildAndDeployer::new(updater.clone(), updater).with_enabled(false);
    let state = state_with(&["/app/main.py"], vec![container("c1")]);
    assert!(bad.build_and_deploy(&web_specs(), &state).await.unwrap_err().is_redirect());
  }
}
