mod next;
mod order;
mod plan;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use devloop_lib::store::EngineState;

pub use next::cmd_next;
pub use order::cmd_order;
pub use plan::cmd_plan;

/// An engine state snapshot as written by a running engine or by hand.
#[derive(Debug, Deserialize)]
pub struct StateFile {
  #[serde(flatten)]
  pub state: EngineState,
  /// Image references known to exist locally. When absent every previously
  /// built image is assumed to still exist.
  #[serde(default)]
  pub images: Option<Vec<String>>,
}

pub fn load_state(path: &Path) -> Result<StateFile> {
  let content = fs::read_to_string(path).with_context(|| format!("Failed to read state file: {}", path.display()))?;
  serde_json::from_str(&content).with_context(|| format!("Failed to parse state file: {}", path.display()))
}
