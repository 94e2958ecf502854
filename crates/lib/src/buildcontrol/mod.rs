//! Deciding what to build next and how to build it.
//!
//! [`next_target_to_build`] picks at most one manifest from the engine state.
//! Its targets are then handed to a [`BuildAndDeployer`], usually a
//! [`CompositeBuildAndDeployer`] that tries live update before a full build.

pub mod composite;
pub mod errors;
pub mod full_build;
pub mod live_update;
pub mod scheduler;
pub mod target_queue;

use async_trait::async_trait;

pub use composite::CompositeBuildAndDeployer;
pub use errors::{BuildError, CollaboratorError, RedirectLevel, TargetFailure};
pub use full_build::FullBuildAndDeployer;
pub use live_update::{ContainerUpdater, LiveUpdateBuildAndDeployer, LiveUpdateTarget, extract_live_update_targets};
pub use scheduler::next_target_to_build;
pub use target_queue::{ImageChecker, QueueError, TargetBuilder, TargetQueue};

use crate::model::TargetSpec;
use crate::store::{BuildResultSet, BuildStateSet};

/// One strategy for bringing a manifest's targets up to date.
#[async_trait]
pub trait BuildAndDeployer: Send + Sync {
  /// Short name used in logs.
  fn name(&self) -> &'static str;

  /// Build and deploy `specs`, all belonging to one manifest.
  ///
  /// A [`BuildError::Redirect`] means this strategy does not apply and the
  /// caller should try the next one.
  async fn build_and_deploy(&self, specs: &[TargetSpec], state: &BuildStateSet) -> Result<BuildResultSet, BuildError>;
}
