//! Discovering which running containers a live update may patch.
//!
//! Container enumeration is conservative: if any container that matches a
//! target is not fully known (no id, no name, or not running), nothing is
//! returned and the caller falls back to a full build.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ContainerSelector;
use crate::store::{ContainerStatus, Pod};

/// A running container that can receive a live update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
  pub pod_name: Option<String>,
  pub namespace: Option<String>,
  pub container_id: String,
  pub container_name: String,
}

impl Container {
  /// Short label for logs, `pod/container` or just the container name.
  pub fn display_name(&self) -> String {
    match &self.pod_name {
      Some(pod) => format!("{pod}/{}", self.container_name),
      None => self.container_name.clone(),
    }
  }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContainerError {
  #[error("can only live update one pod at a time, found {count} active pods for {image}")]
  TooManyPods { image: String, count: usize },
}

/// Repository part of an image reference, without tag or digest.
pub fn image_name(reference: &str) -> &str {
  let without_digest = reference.split('@').next().unwrap_or(reference);
  match (without_digest.rfind(':'), without_digest.rfind('/')) {
    (Some(colon), Some(slash)) if colon > slash => &without_digest[..colon],
    (Some(colon), None) => &without_digest[..colon],
    _ => without_digest,
  }
}

/// Whether a discovered container belongs to the image target.
///
/// The selector's image overrides the target's own image reference.
pub fn matches_selector(selector: &ContainerSelector, image_ref: &str, status: &ContainerStatus) -> bool {
  let wanted = selector.image.as_deref().unwrap_or(image_ref);
  if image_name(wanted) != image_name(&status.image) {
    return false;
  }
  match &selector.container_name {
    Some(name) => status.name.as_deref() == Some(name.as_str()),
    None => true,
  }
}

/// Containers in the single active pod that run the target's image.
///
/// Completed or deleting pods are ignored. More than one active pod is an
/// error because an update would race between them.
pub fn running_containers_for_pods(
  selector: &ContainerSelector,
  image_ref: &str,
  pods: &[Pod],
) -> Result<Vec<Container>, ContainerError> {
  let active: Vec<&Pod> = pods.iter().filter(|p| !p.phase.is_completed() && !p.deleting).collect();
  if active.len() > 1 {
    return Err(ContainerError::TooManyPods {
      image: image_ref.to_string(),
      count: active.len(),
    });
  }
  let Some(pod) = active.first() else {
    return Ok(Vec::new());
  };

  let mut containers = Vec::new();
  for status in pod.containers.iter().filter(|c| matches_selector(selector, image_ref, c)) {
    let Some(container) = known_container(status, Some(pod)) else {
      return Ok(Vec::new());
    };
    containers.push(container);
  }
  Ok(containers)
}

/// The container backing a compose service, if it is fully known.
pub fn running_containers_for_compose(status: Option<&ContainerStatus>) -> Vec<Container> {
  status.and_then(|s| known_container(s, None)).into_iter().collect()
}

fn known_container(status: &ContainerStatus, pod: Option<&Pod>) -> Option<Container> {
  if !status.running {
    return None;
  }
  let container_id = status.id.clone().filter(|id| !id.is_empty())?;
  let container_name = status.name.clone().filter(|n| !n.is_empty())?;
  Some(Container {
    pod_name: pod.map(|p| p.name.clone()),
    namespace: pod.map(|p| p.namespace.clone()),
    container_id,
    container_name,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::PodPhase;

  fn status(id: &str, name: &str, image: &str) -> ContainerStatus {
    ContainerStatus {
      id: Some(id.to_string()),
      name: Some(name.to_string()),
      image: image.to_string(),
      running: true,
      ready: true,
      restarts: 0,
    }
  }

  fn pod(name: &str, phase: PodPhase, containers: Vec<ContainerStatus>) -> Pod {
    Pod {
      name: name.to_string(),
      namespace: "default".to_string(),
      phase,
      deleting: false,
      containers,
    }
  }

  #[test]
  fn image_name_strips_tag_and_digest() {
    assert_eq!(image_name("gcr.io/proj/app:dev-123"), "gcr.io/proj/app");
    assert_eq!(image_name("localhost:5000/app"), "localhost:5000/app");
    assert_eq!(image_name("app@sha256:abcd"), "app");
    assert_eq!(image_name("app"), "app");
  }

  #[test]
  fn matching_containers_in_active_pod() {
    let pods = vec![pod(
      "web-1",
      PodPhase::Running,
      vec![
        status("c1", "app", "registry/app:dev-1"),
        status("c2", "sidecar", "registry/proxy:v2"),
      ],
    )];

    let found = running_containers_for_pods(&ContainerSelector::default(), "registry/app", &pods).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].container_id, "c1");
    assert_eq!(found[0].display_name(), "web-1/app");
  }

  #[test]
  fn completed_pods_are_ignored() {
    let pods = vec![
      pod("old", PodPhase::Succeeded, vec![status("c0", "app", "registry/app")]),
      pod("new", PodPhase::Running, vec![status("c1", "app", "registry/app")]),
    ];
    let found = running_containers_for_pods(&ContainerSelector::default(), "registry/app", &pods).unwrap();
    assert_eq!(found[0].pod_name.as_deref(), Some("new"));
  }

  #[test]
  fn two_active_pods_is_an_error() {
    let pods = vec![
      pod("a", PodPhase::Running, vec![status("c1", "app", "registry/app")]),
      pod("b", PodPhase::Pending, vec![status("c2", "app", "registry/app")]),
    ];
    let err = running_containers_for_pods(&ContainerSelector::default(), "registry/app", &pods).unwrap_err();
    assert!(matches!(err, ContainerError::TooManyPods { count: 2, .. }));
  }

  #[test]
  fn one_unknown_container_means_none() {
    let mut waiting = status("", "app-2", "registry/app");
    waiting.id = None;
    let pods = vec![pod(
      "web",
      PodPhase::Running,
      vec![status("c1", "app-1", "registry/app"), waiting],
    )];
    let found = running_containers_for_pods(&ContainerSelector::default(), "registry/app", &pods).unwrap();
    assert!(found.is_empty());
  }

  #[test]
  fn selector_narrows_by_container_name() {
    let pods = vec![pod(
      "web",
      PodPhase::Running,
      vec![
        status("c1", "app", "registry/app"),
        status("c2", "worker", "registry/app"),
      ],
    )];
    let selector = ContainerSelector {
      image: None,
      container_name: Some("worker".to_string()),
    };
    let found = running_containers_for_pods(&selector, "registry/app", &pods).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].container_id, "c2");
  }

  #[test]
  fn compose_container_must_be_running() {
    let mut stopped = status("c1", "web", "app");
    stopped.running = false;
    assert!(running_containers_for_compose(Some(&stopped)).is_empty());
    assert_eq!(running_containers_for_compose(Some(&status("c1", "web", "app"))).len(), 1);
    assert!(running_containers_for_compose(None).is_empty());
  }
}
