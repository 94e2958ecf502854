//! Engine configuration.
//!
//! Read from a JSON file, then overridden by environment variables:
//!
//! - `DEVLOOP_MAX_PARALLEL_UPDATES`: how many manifests may build at once
//! - `DEVLOOP_UPDATE_MODE`: `auto`, `container` or `exec`

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const MAX_PARALLEL_UPDATES_ENV: &str = "DEVLOOP_MAX_PARALLEL_UPDATES";
pub const UPDATE_MODE_ENV: &str = "DEVLOOP_UPDATE_MODE";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config {path}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config {path}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid value {value:?} for {var}")]
  InvalidEnv { var: &'static str, value: String },

  #[error("max_parallel_updates must be at least 1")]
  ZeroParallelism,
}

/// How files reach a running container during a live update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateMode {
  /// Talk to the container runtime directly for compose, exec into pods for
  /// Kubernetes.
  #[default]
  Auto,
  /// Always go through the container runtime.
  Container,
  /// Always exec into the container.
  Exec,
}

impl FromStr for UpdateMode {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "auto" => Ok(UpdateMode::Auto),
      "container" => Ok(UpdateMode::Container),
      "exec" => Ok(UpdateMode::Exec),
      _ => Err(()),
    }
  }
}

impl fmt::Display for UpdateMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      UpdateMode::Auto => "auto",
      UpdateMode::Container => "container",
      UpdateMode::Exec => "exec",
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub max_parallel_updates: usize,
  pub update_mode: UpdateMode,
  pub live_update_enabled: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      max_parallel_updates: 3,
      update_mode: UpdateMode::Auto,
      live_update_enabled: true,
    }
  }
}

impl EngineConfig {
  /// Load from `path`, falling back to defaults if the file does not exist,
  /// then apply environment overrides.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let config = match std::fs::read_to_string(path) {
      Ok(content) => serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
      })?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!(path = %path.display(), "no config file, using defaults");
        EngineConfig::default()
      }
      Err(source) => {
        return Err(ConfigError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };
    config.with_env_overrides()
  }

  pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
    if let Ok(value) = std::env::var(MAX_PARALLEL_UPDATES_ENV) {
      self.max_parallel_updates = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: MAX_PARALLEL_UPDATES_ENV,
        value: value.clone(),
      })?;
    }
    if let Ok(value) = std::env::var(UPDATE_MODE_ENV) {
      self.update_mode = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: UPDATE_MODE_ENV,
        value: value.clone(),
      })?;
    }
    if self.max_parallel_updates == 0 {
      return Err(ConfigError::ZeroParallelism);
    }
    Ok(self)
  }
}
