//! The control loop that turns scheduling decisions into running builds.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::buildcontrol::{BuildAndDeployer, BuildError, next_target_to_build};
use crate::config::EngineConfig;
use crate::model::{ManifestName, TargetSpec};
use crate::store::reducers::{handle_build_completed, handle_build_started};
use crate::store::{BuildCompleted, BuildFailure, BuildResultSet, BuildStateSet, SharedEngineState};

/// Everything a build task needs, captured under the read lock.
struct BuildJob {
  manifest: ManifestName,
  specs: Vec<TargetSpec>,
  state: BuildStateSet,
}

pub struct BuildController {
  state: SharedEngineState,
  bad: Arc<dyn BuildAndDeployer>,
  config: EngineConfig,
  cancel: CancellationToken,
}

impl BuildController {
  pub fn new(state: SharedEngineState, bad: Arc<dyn BuildAndDeployer>, config: EngineConfig) -> Self {
    Self {
      state,
      bad,
      config,
      cancel: CancellationToken::new(),
    }
  }

  pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  /// Token that stops the loop and cancels in-flight builds.
  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  /// Run until cancelled. In-flight builds observe the cancellation and are
  /// recorded as failed before this returns.
  pub async fn run(self) {
    let mut builds = JoinSet::new();
    info!(max_parallel_updates = self.config.max_parallel_updates, "build controller started");

    loop {
      self.start_builds(&mut builds);
      tokio::select! {
        _ = self.cancel.cancelled() => break,
        _ = self.state.changed() => {}
        Some(joined) = builds.join_next() => log_join_error(joined),
      }
    }

    while let Some(joined) = builds.join_next().await {
      log_join_error(joined);
    }
    info!("build controller stopped");
  }

  /// Start builds until the scheduler has nothing eligible or the parallelism
  /// limit is reached. Returns how many were started.
  pub fn start_builds(&self, builds: &mut JoinSet<()>) -> usize {
    let mut started = 0;
    while !self.cancel.is_cancelled() {
      let Some(job) = self.next_job() else {
        break;
      };
      let start_time = Utc::now();
      if self
        .state
        .write(|s| handle_build_started(s, &job.manifest, start_time))
        .is_none()
      {
        break;
      }

      let bad = self.bad.clone();
      let shared = self.state.clone();
      let cancel = self.cancel.clone();
      builds.spawn(async move {
        let outcome = tokio::select! {
          biased;
          _ = cancel.cancelled() => Err(BuildError::Canceled),
          outcome = bad.build_and_deploy(&job.specs, &job.state) => outcome,
        };
        let completed = build_completed(job.manifest, start_time, Utc::now(), outcome);
        shared.write(|s| handle_build_completed(s, completed));
      });
      started += 1;
    }
    started
  }

  fn next_job(&self) -> Option<BuildJob> {
    self.state.read(|state| {
      let building = state.currently_building().len();
      if building >= self.config.max_parallel_updates {
        debug!(building, "at parallel update limit");
        return None;
      }

      let (next, holds) = next_target_to_build(state);
      for (name, hold) in holds.iter() {
        debug!(manifest = %name, hold = %hold, "holding");
      }
      let mt = next?;
      Some(BuildJob {
        manifest: mt.name().clone(),
        specs: mt.manifest.targets.clone(),
        state: state.build_state_set_for(mt),
      })
    })
  }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
  if let Err(e) = joined {
    error!(error = %e, "build task panicked");
  }
}

/// Translate a build outcome into the completion event for the reducers.
/// Targets that finished before a failure keep their results.
pub fn build_completed(
  manifest: ManifestName,
  start_time: DateTime<Utc>,
  finish_time: DateTime<Utc>,
  outcome: Result<BuildResultSet, BuildError>,
) -> BuildCompleted {
  let (results, failure) = match outcome {
    Ok(results) => (results, None),
    Err(err) => {
      let failure = BuildFailure {
        kind: err.failure_kind(),
        message: err.to_string(),
      };
      let results = match err {
        BuildError::TargetsFailed { completed, .. } => completed,
        _ => BuildResultSet::new(),
      };
      (results, Some(failure))
    }
  };
  BuildCompleted {
    manifest,
    start_time,
    finish_time,
    results,
    failure,
  }
}
