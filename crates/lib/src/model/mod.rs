//! Build targets, manifests and their identities.
//!
//! A [`Manifest`] is one user-facing resource. It owns an ordered list of
//! [`TargetSpec`]s: zero or more image targets followed by at most one deploy
//! target (Kubernetes, Docker Compose or a local command). Every target has a
//! stable [`TargetId`] and the ids of the targets it must be built after.

pub mod graph;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use graph::{GraphError, TargetGraph, topological_sort};

/// Manifest name reserved for deploy YAML that no resource claimed.
pub const UNRESOURCED_YAML_MANIFEST_NAME: &str = "uncategorized";

/// The kind half of a [`TargetId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
  Image,
  K8s,
  DockerCompose,
  Local,
  /// A manifest's own identity. Only used to name holds.
  Manifest,
  /// A config-loading unit (the project file that declares manifests).
  ConfigFile,
}

impl TargetKind {
  pub fn as_str(self) -> &'static str {
    match self {
      TargetKind::Image => "image",
      TargetKind::K8s => "k8s",
      TargetKind::DockerCompose => "docker-compose",
      TargetKind::Local => "local",
      TargetKind::Manifest => "manifest",
      TargetKind::ConfigFile => "config-file",
    }
  }
}

impl fmt::Display for TargetKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Returned when a `<kind>:<name>` string cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid target id {0:?}: expected <kind>:<name>")]
pub struct ParseTargetIdError(pub String);

impl FromStr for TargetKind {
  type Err = ParseTargetIdError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "image" => Ok(TargetKind::Image),
      "k8s" => Ok(TargetKind::K8s),
      "docker-compose" => Ok(TargetKind::DockerCompose),
      "local" => Ok(TargetKind::Local),
      "manifest" => Ok(TargetKind::Manifest),
      "config-file" => Ok(TargetKind::ConfigFile),
      _ => Err(ParseTargetIdError(s.to_string())),
    }
  }
}

/// Opaque, immutable identity of a target.
///
/// Serialized as its `<kind>:<name>` string so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetId {
  pub kind: TargetKind,
  pub name: String,
}

impl TargetId {
  pub fn new(kind: TargetKind, name: impl Into<String>) -> Self {
    Self {
      kind,
      name: name.into(),
    }
  }

  pub fn image(name: impl Into<String>) -> Self {
    Self::new(TargetKind::Image, name)
  }

  pub fn k8s(name: impl Into<String>) -> Self {
    Self::new(TargetKind::K8s, name)
  }

  pub fn docker_compose(name: impl Into<String>) -> Self {
    Self::new(TargetKind::DockerCompose, name)
  }

  pub fn local(name: impl Into<String>) -> Self {
    Self::new(TargetKind::Local, name)
  }

  pub fn manifest(name: impl Into<String>) -> Self {
    Self::new(TargetKind::Manifest, name)
  }

  pub fn config_file(name: impl Into<String>) -> Self {
    Self::new(TargetKind::ConfigFile, name)
  }
}

impl fmt::Display for TargetId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.kind, self.name)
  }
}

impl FromStr for TargetId {
  type Err = ParseTargetIdError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (kind, name) = s.split_once(':').ok_or_else(|| ParseTargetIdError(s.to_string()))?;
    if name.is_empty() {
      return Err(ParseTargetIdError(s.to_string()));
    }
    let kind = kind.parse().map_err(|_| ParseTargetIdError(s.to_string()))?;
    Ok(TargetId::new(kind, name))
  }
}

impl TryFrom<String> for TargetId {
  type Error = ParseTargetIdError;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    s.parse()
  }
}

impl From<TargetId> for String {
  fn from(id: TargetId) -> Self {
    id.to_string()
  }
}

/// Name of a manifest, unique within an engine state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestName(pub String);

impl ManifestName {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn target_id(&self) -> TargetId {
    TargetId::manifest(self.0.clone())
  }
}

impl fmt::Display for ManifestName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ManifestName {
  fn from(name: &str) -> Self {
    ManifestName(name.to_string())
  }
}

/// When a manifest builds on its own, and when it waits for a manual trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
  /// Build on startup and on every change.
  #[default]
  Auto,
  /// Build on startup, then only when triggered.
  ManualWithAutoInit,
  /// Only build when triggered.
  Manual,
  /// Wait for a trigger before the first build, then build on every change.
  AutoWithManualInit,
}

impl TriggerMode {
  /// Whether file changes start a build without a manual trigger.
  pub fn auto_on_change(self) -> bool {
    matches!(self, TriggerMode::Auto | TriggerMode::AutoWithManualInit)
  }

  /// Whether the first build starts without a manual trigger.
  pub fn auto_initial(self) -> bool {
    matches!(self, TriggerMode::Auto | TriggerMode::ManualWithAutoInit)
  }
}

/// Copies files under `local_path` to `container_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveUpdateSync {
  pub local_path: PathBuf,
  /// Always a POSIX path, regardless of the host platform.
  pub container_path: String,
}

/// A command re-run in the container after a sync.
///
/// With no trigger paths the command runs after every sync. Otherwise it runs
/// only when a synced file is at or under one of the triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveUpdateExec {
  pub args: Vec<String>,
  #[serde(default)]
  pub trigger_paths: Vec<PathBuf>,
}

/// How changed files are patched into a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveUpdateSpec {
  pub base_path: PathBuf,
  pub syncs: Vec<LiveUpdateSync>,
  pub execs: Vec<LiveUpdateExec>,
  /// Any change at or under one of these paths forces a full rebuild.
  pub fall_back_on: Vec<PathBuf>,
  /// Restart the container after syncing instead of relying on hot reload.
  pub restart: bool,
}

impl LiveUpdateSpec {
  pub fn is_empty(&self) -> bool {
    self.syncs.is_empty() && self.execs.is_empty()
  }
}

/// Narrows the discovered containers a live update may touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSelector {
  /// Image name (tag and digest ignored) the container must run.
  pub image: Option<String>,
  pub container_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTarget {
  pub name: String,
  /// Repository the built image is pushed to or loaded as.
  pub image_ref: String,
  #[serde(default)]
  pub dependencies: Vec<TargetId>,
  #[serde(default)]
  pub live_update: LiveUpdateSpec,
  #[serde(default)]
  pub selector: ContainerSelector,
  /// The image is never built, containers are only patched in place.
  #[serde(default)]
  pub live_update_only: bool,
  /// Live update for this image is driven by a continuous reconciler.
  #[serde(default)]
  pub live_update_reconciler: bool,
}

impl ImageTarget {
  pub fn id(&self) -> TargetId {
    TargetId::image(self.name.clone())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct K8sTarget {
  pub name: String,
  #[serde(default)]
  pub dependencies: Vec<TargetId>,
  /// Names of the objects this target applies, e.g. `deployment/frontend`.
  #[serde(default)]
  pub entities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerComposeTarget {
  pub name: String,
  pub service: String,
  #[serde(default)]
  pub dependencies: Vec<TargetId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTarget {
  pub name: String,
  #[serde(default)]
  pub cmd: Vec<String>,
  #[serde(default)]
  pub dependencies: Vec<TargetId>,
  /// Local commands may touch the disk that other builds read, so by default
  /// nothing else builds while one runs.
  #[serde(default)]
  pub allow_parallel: bool,
}

/// One buildable or deployable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TargetSpec {
  Image(ImageTarget),
  K8s(K8sTarget),
  DockerCompose(DockerComposeTarget),
  Local(LocalTarget),
}

impl TargetSpec {
  pub fn id(&self) -> TargetId {
    match self {
      TargetSpec::Image(t) => TargetId::image(t.name.clone()),
      TargetSpec::K8s(t) => TargetId::k8s(t.name.clone()),
      TargetSpec::DockerCompose(t) => TargetId::docker_compose(t.name.clone()),
      TargetSpec::Local(t) => TargetId::local(t.name.clone()),
    }
  }

  /// Direct build-order predecessors, in declared order.
  pub fn dependency_ids(&self) -> &[TargetId] {
    match self {
      TargetSpec::Image(t) => &t.dependencies,
      TargetSpec::K8s(t) => &t.dependencies,
      TargetSpec::DockerCompose(t) => &t.dependencies,
      TargetSpec::Local(t) => &t.dependencies,
    }
  }

  pub fn as_image(&self) -> Option<&ImageTarget> {
    match self {
      TargetSpec::Image(t) => Some(t),
      _ => None,
    }
  }

  pub fn is_deploy(&self) -> bool {
    matches!(self, TargetSpec::K8s(_) | TargetSpec::DockerCompose(_))
  }
}

/// A named collection of targets representing one user-facing resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
  pub name: ManifestName,
  /// Image targets first, then the deploy target, in declared order.
  #[serde(default)]
  pub targets: Vec<TargetSpec>,
  /// Manifests that must have been ready once before this one first builds.
  #[serde(default)]
  pub resource_dependencies: Vec<ManifestName>,
  #[serde(default)]
  pub trigger_mode: TriggerMode,
}

impl Manifest {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: ManifestName::new(name),
      targets: Vec::new(),
      resource_dependencies: Vec::new(),
      trigger_mode: TriggerMode::default(),
    }
  }

  pub fn with_target(mut self, target: TargetSpec) -> Self {
    self.targets.push(target);
    self
  }

  pub fn with_trigger_mode(mut self, mode: TriggerMode) -> Self {
    self.trigger_mode = mode;
    self
  }

  pub fn with_resource_dependency(mut self, name: impl Into<String>) -> Self {
    self.resource_dependencies.push(ManifestName::new(name));
    self
  }

  pub fn id(&self) -> TargetId {
    self.name.target_id()
  }

  pub fn target_specs(&self) -> &[TargetSpec] {
    &self.targets
  }

  pub fn image_targets(&self) -> impl Iterator<Item = &ImageTarget> {
    self.targets.iter().filter_map(TargetSpec::as_image)
  }

  pub fn image_target(&self, id: &TargetId) -> Option<&ImageTarget> {
    self.image_targets().find(|t| &t.id() == id)
  }

  pub fn deploy_target(&self) -> Option<&TargetSpec> {
    self.targets.iter().find(|t| t.as_image().is_none())
  }

  pub fn local_target(&self) -> Option<&LocalTarget> {
    self.targets.iter().find_map(|t| match t {
      TargetSpec::Local(l) => Some(l),
      _ => None,
    })
  }

  pub fn is_local(&self) -> bool {
    self.local_target().is_some()
  }

  pub fn is_k8s(&self) -> bool {
    self.targets.iter().any(|t| matches!(t, TargetSpec::K8s(_)))
  }

  pub fn is_docker_compose(&self) -> bool {
    self.targets.iter().any(|t| matches!(t, TargetSpec::DockerCompose(_)))
  }

  pub fn is_unresourced_yaml(&self) -> bool {
    self.name.as_str() == UNRESOURCED_YAML_MANIFEST_NAME
  }

  /// True for a local target that must not overlap with any other build.
  pub fn is_unparallelizable_local(&self) -> bool {
    self.local_target().is_some_and(|l| !l.allow_parallel)
  }

  pub fn contains_target(&self, id: &TargetId) -> bool {
    self.targets.iter().any(|t| &t.id() == id)
  }
}
