//! Chains build strategies from cheapest to most expensive.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::BuildAndDeployer;
use super::errors::{BuildError, RedirectLevel};
use crate::model::TargetSpec;
use crate::store::{BuildResultSet, BuildStateSet};

/// Tries each strategy in order until one succeeds or fails in a way that
/// another strategy could not fix.
///
/// When every strategy falls back, the last unexpected error wins over the
/// last redirect, since a redirect only explains why a strategy was skipped.
pub struct CompositeBuildAndDeployer {
  builders: Vec<Arc<dyn BuildAndDeployer>>,
}

impl CompositeBuildAndDeployer {
  pub fn new(builders: Vec<Arc<dyn BuildAndDeployer>>) -> Self {
    Self { builders }
  }
}

#[async_trait]
impl BuildAndDeployer for CompositeBuildAndDeployer {
  fn name(&self) -> &'static str {
    "composite"
  }

  async fn build_and_deploy(&self, specs: &[TargetSpec], state: &BuildStateSet) -> Result<BuildResultSet, BuildError> {
    let mut last_unexpected: Option<BuildError> = None;
    let mut last: Option<BuildError> = None;

    for (i, builder) in self.builders.iter().enumerate() {
      let err = match builder.build_and_deploy(specs, state).await {
        Ok(results) => return Ok(results),
        Err(err) if !err.should_fall_back() => return Err(err),
        Err(err) => err,
      };

      let has_next = i + 1 < self.builders.len();
      match &err {
        BuildError::Redirect {
          message,
          level: RedirectLevel::Info,
        } => info!(strategy = builder.name(), "{message}"),
        BuildError::Redirect { message, .. } => debug!(strategy = builder.name(), "{message}"),
        _ => {
          if has_next {
            info!(strategy = builder.name(), error = %err, "falling back to next update method");
          }
          last_unexpected = Some(err);
          continue;
        }
      }
      last = Some(err);
    }

    Err(
      last_unexpected
        .or(last)
        .unwrap_or_else(|| BuildError::Failed("no build strategies configured".to_string())),
    )
  }
}
