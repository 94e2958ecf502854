//! Reasons a manifest is not eligible to build on this scheduling pass.
//!
//! Holds are recomputed from scratch every time the scheduler runs and are
//! never stored in the engine state.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::model::{ManifestName, TargetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HoldReason {
  /// A config file changed and must be reloaded first.
  ConfigReload,
  WaitingForUnparallelizableTarget,
  IsUnparallelizableTarget,
  WaitingForUncategorized,
  /// Shares an image target with a manifest that is currently building.
  BuildingComponent,
  /// A resource dependency has never become ready.
  WaitingForDep,
  Disabled,
  /// Changes can be live updated, but the current deploy has not come up yet.
  WaitingForDeploy,
  /// A live update reconciler is already handling the changes.
  Reconciling,
}

impl HoldReason {
  pub fn as_str(self) -> &'static str {
    match self {
      HoldReason::ConfigReload => "waiting-for-config-reload",
      HoldReason::WaitingForUnparallelizableTarget => "waiting-for-unparallelizable-target",
      HoldReason::IsUnparallelizableTarget => "is-unparallelizable-target",
      HoldReason::WaitingForUncategorized => "waiting-for-uncategorized",
      HoldReason::BuildingComponent => "building-component",
      HoldReason::WaitingForDep => "waiting-for-dependencies",
      HoldReason::Disabled => "disabled",
      HoldReason::WaitingForDeploy => "waiting-for-deploy",
      HoldReason::Reconciling => "reconciling",
    }
  }
}

impl fmt::Display for HoldReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hold {
  pub reason: HoldReason,
  /// The targets being waited on, if the reason has any.
  pub hold_on: Vec<TargetId>,
}

impl Hold {
  pub fn new(reason: HoldReason) -> Self {
    Self {
      reason,
      hold_on: Vec::new(),
    }
  }

  pub fn on(reason: HoldReason, hold_on: Vec<TargetId>) -> Self {
    Self { reason, hold_on }
  }
}

impl fmt::Display for Hold {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.reason)?;
    if !self.hold_on.is_empty() {
      let ids: Vec<String> = self.hold_on.iter().map(TargetId::to_string).collect();
      write!(f, " ({})", ids.join(", "))?;
    }
    Ok(())
  }
}

/// The holds applied in one scheduling pass, at most one per manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct HoldSet(BTreeMap<ManifestName, Hold>);

impl HoldSet {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a hold unless the manifest is already held. The first reason wins.
  pub fn add_hold(&mut self, name: &ManifestName, hold: Hold) {
    self.0.entry(name.clone()).or_insert(hold);
  }

  /// Hold every named manifest with the same reason.
  pub fn fill<'a>(&mut self, names: impl IntoIterator<Item = &'a ManifestName>, hold: Hold) {
    for name in names {
      self.add_hold(name, hold.clone());
    }
  }

  pub fn is_eligible(&self, name: &ManifestName) -> bool {
    !self.0.contains_key(name)
  }

  /// Keep only the names that are not held, preserving order.
  pub fn remove_ineligible<'a, T>(&self, items: Vec<&'a T>, name: impl Fn(&T) -> &ManifestName) -> Vec<&'a T> {
    items.into_iter().filter(|item| self.is_eligible(name(item))).collect()
  }

  pub fn get(&self, name: &ManifestName) -> Option<&Hold> {
    self.0.get(name)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&ManifestName, &Hold)> {
    self.0.iter()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}
