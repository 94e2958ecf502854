//! Wiring the scheduler, the build chain and the shared state together.

pub mod controller;

use std::sync::Arc;

pub use controller::{BuildController, build_completed};

use crate::buildcontrol::{
  BuildAndDeployer, CompositeBuildAndDeployer, ContainerUpdater, FullBuildAndDeployer, ImageChecker,
  LiveUpdateBuildAndDeployer, TargetBuilder,
};
use crate::config::EngineConfig;

/// External systems the build chain talks to.
pub struct Collaborators {
  pub builder: Arc<dyn TargetBuilder>,
  pub image_checker: Arc<dyn ImageChecker>,
  /// Copies files through the container runtime.
  pub runtime_updater: Arc<dyn ContainerUpdater>,
  /// Copies files by exec'ing into the container.
  pub exec_updater: Arc<dyn ContainerUpdater>,
}

/// Live update first, then a full build.
pub fn build_chain(config: &EngineConfig, collaborators: Collaborators) -> CompositeBuildAndDeployer {
  let live_update = LiveUpdateBuildAndDeployer::new(collaborators.runtime_updater, collaborators.exec_updater)
    .with_mode(config.update_mode)
    .with_enabled(config.live_update_enabled);
  let full_build = FullBuildAndDeployer::new(collaborators.builder, collaborators.image_checker);

  let builders: Vec<Arc<dyn BuildAndDeployer>> = vec![Arc::new(live_update), Arc::new(full_build)];
  CompositeBuildAndDeployer::new(builders)
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use super::*;
  use crate::model::TargetId;
  use crate::store::{BuildState, BuildStateSet};
  use crate::util::testutil::{
    FakeBuilder, FakeContainerUpdater, FakeImageChecker, container, image_result, image_with_sync, k8s_manifest,
  };

  fn collaborators(builder: Arc<FakeBuilder>, updater: Arc<FakeContainerUpdater>) -> Collaborators {
    Collaborators {
      builder,
      image_checker: Arc::new(FakeImageChecker::all_present()),
      runtime_updater: updater.clone(),
      exec_updater: updater,
    }
  }

  #[tokio::test]
  async fn first_deploy_falls_through_to_full_build() {
    let builder = Arc::new(FakeBuilder::default());
    let updater = Arc::new(FakeContainerUpdater::default());
    let chain = build_chain(&EngineConfig::default(), collaborators(builder.clone(), updater.clone()));
    let specs = k8s_manifest("web", vec![image_with_sync("web", "/app", "/src")]).targets;

    let results = chain.build_and_deploy(&specs, &BuildStateSet::new()).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(builder.calls().len(), 2);
    assert!(updater.calls().is_empty());
  }

  #[tokio::test]
  async fn disabled_live_update_always_builds() {
    let builder = Arc::new(FakeBuilder::default());
    let updater = Arc::new(FakeContainerUpdater::default());
    let config = EngineConfig {
      live_update_enabled: false,
      ..EngineConfig::default()
    };
    let chain = build_chain(&config, collaborators(builder.clone(), updater.clone()));
    let specs = k8s_manifest("web", vec![image_with_sync("web", "/app", "/src")]).targets;

    let mut state = BuildStateSet::new();
    state.insert(
      TargetId::image("web"),
      BuildState::new(
        Some(image_result("web", "registry/web:dev-1")),
        [PathBuf::from("/app/main.py")],
      )
      .with_running_containers(vec![container("c1")]),
    );

    chain.build_and_deploy(&specs, &state).await.unwrap();
    assert!(updater.calls().is_empty());
    assert!(!builder.calls().is_empty());
  }
}
