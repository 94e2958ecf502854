//! Observed runtime state of a manifest's deployed workload.

use serde::{Deserialize, Serialize};

/// Coarse health of a manifest's runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeStatus {
  #[default]
  Unknown,
  Pending,
  Ok,
  Error,
  /// Nothing runs for this manifest (e.g. a one-shot local command).
  NotApplicable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PodPhase {
  #[default]
  Pending,
  Running,
  Succeeded,
  Failed,
  Unknown,
}

impl PodPhase {
  /// Completed pods never receive a live update.
  pub fn is_completed(self) -> bool {
    matches!(self, PodPhase::Succeeded | PodPhase::Failed)
  }
}

/// One container as reported by the runtime. Fields may be missing while the
/// container is still being scheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerStatus {
  pub id: Option<String>,
  pub name: Option<String>,
  /// Image reference the container was started from.
  pub image: String,
  pub running: bool,
  pub ready: bool,
  pub restarts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pod {
  pub name: String,
  pub namespace: String,
  pub phase: PodPhase,
  /// Set once the pod has been asked to shut down.
  pub deleting: bool,
  pub containers: Vec<ContainerStatus>,
}

impl Pod {
  pub fn all_containers_ready(&self) -> bool {
    !self.containers.is_empty() && self.containers.iter().all(|c| c.ready)
  }

  pub fn total_restarts(&self) -> u32 {
    self.containers.iter().map(|c| c.restarts).sum()
  }
}

/// Runtime facts the scheduler and live update read for one manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeState {
  pub status: RuntimeStatus,
  /// Whether the workload has been ready at least once since it was deployed.
  pub ever_ready: bool,
  pub pods: Vec<Pod>,
  /// The single container backing a compose service.
  pub compose_container: Option<ContainerStatus>,
}

impl RuntimeState {
  pub fn has_ever_been_ready(&self) -> bool {
    self.ever_ready || matches!(self.status, RuntimeStatus::Ok | RuntimeStatus::NotApplicable)
  }

  /// The pod that live update and deploy-wait checks look at: the first one
  /// that is not shutting down.
  pub fn most_recent_pod(&self) -> Option<&Pod> {
    self.pods.iter().find(|p| !p.deleting)
  }

  pub fn restarts(&self) -> u32 {
    self.pods.iter().map(Pod::total_restarts).sum::<u32>()
      + self.compose_container.as_ref().map_or(0, |c| c.restarts)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ever_ready_follows_status() {
    let mut state = RuntimeState::default();
    assert!(!state.has_ever_been_ready());
    state.status = RuntimeStatus::NotApplicable;
    assert!(state.has_ever_been_ready());
  }

  #[test]
  fn most_recent_pod_skips_deleting() {
    let state = RuntimeState {
      pods: vec![
        Pod {
          name: "old".to_string(),
          deleting: true,
          ..Pod::default()
        },
        Pod {
          name: "new".to_string(),
          ..Pod::default()
        },
      ],
      ..RuntimeState::default()
    };
    assert_eq!(state.most_recent_pod().map(|p| p.name.as_str()), Some("new"));
  }
}
