//! Build strategy that builds every dirty target from scratch.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::BuildAndDeployer;
use super::errors::BuildError;
use super::target_queue::{ImageChecker, TargetBuilder, TargetQueue};
use crate::model::TargetSpec;
use crate::store::{BuildResult, BuildResultSet, BuildState, BuildStateSet};

pub struct FullBuildAndDeployer {
  builder: Arc<dyn TargetBuilder>,
  checker: Arc<dyn ImageChecker>,
}

impl FullBuildAndDeployer {
  pub fn new(builder: Arc<dyn TargetBuilder>, checker: Arc<dyn ImageChecker>) -> Self {
    Self { builder, checker }
  }
}

/// Images marked live-update-only are never built: the declared reference is
/// deployed as is.
struct SkipLiveUpdateOnly<'a> {
  inner: &'a dyn TargetBuilder,
}

#[async_trait]
impl TargetBuilder for SkipLiveUpdateOnly<'_> {
  async fn build(
    &self,
    spec: &TargetSpec,
    state: &BuildState,
    dependency_results: &[BuildResult],
  ) -> Result<BuildResult, BuildError> {
    if let TargetSpec::Image(image) = spec
      && image.live_update_only
    {
      debug!(target = %image.id(), "live-update-only image, using declared reference");
      return Ok(BuildResult::Image {
        target: image.id(),
        image_ref: image.image_ref.clone(),
      });
    }
    self.inner.build(spec, state, dependency_results).await
  }
}

#[async_trait]
impl BuildAndDeployer for FullBuildAndDeployer {
  fn name(&self) -> &'static str {
    "full-build"
  }

  async fn build_and_deploy(&self, specs: &[TargetSpec], state: &BuildStateSet) -> Result<BuildResultSet, BuildError> {
    let mut queue = TargetQueue::new(specs, state.clone(), self.checker.as_ref()).await?;
    let handler = SkipLiveUpdateOnly {
      inner: self.builder.as_ref(),
    };
    queue.run_builds(&handler).await?;

    info!(
      built = queue.count_builds(),
      reused = queue.reused_results().len(),
      failed = queue.failures().len(),
      "full build finished"
    );
    queue.into_outcome()
  }
}
