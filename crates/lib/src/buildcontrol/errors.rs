//! Errors for build rounds and how the build chain reacts to them.

use std::fmt;

use thiserror::Error;

use super::target_queue::QueueError;
use crate::liveupdate::{ContainerError, PlanError};
use crate::model::{GraphError, TargetId};
use crate::store::{BuildResultSet, FailureKind};

/// Error type returned by external collaborators (builders, runtimes).
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// How loudly a redirect to the next build strategy is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectLevel {
  /// Expected, e.g. the first deploy of an image.
  Debug,
  /// Worth telling the user why the cheaper strategy was skipped.
  Info,
}

/// A target whose build handler returned an error.
#[derive(Debug)]
pub struct TargetFailure {
  pub target: TargetId,
  pub error: BuildError,
}

impl fmt::Display for TargetFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.target, self.error)
  }
}

#[derive(Debug, Error)]
pub enum BuildError {
  /// Not a failure: try the next, more expensive strategy.
  #[error("{message}")]
  Redirect { message: String, level: RedirectLevel },

  /// A user command inside a container exited non-zero.
  #[error("command \"{cmd}\" failed in container {container} with exit code {exit_code}")]
  RunStepFailure {
    container: String,
    cmd: String,
    exit_code: i32,
  },

  /// The fix is on the user's side; trying another strategy would not help.
  #[error("{0}")]
  DontFallBack(Box<BuildError>),

  /// Containers were left in different states; only a full build recovers.
  #[error("{0}")]
  InconsistentState(String),

  #[error("build canceled")]
  Canceled,

  #[error(transparent)]
  Queue(#[from] QueueError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Plan(#[from] PlanError),

  #[error(transparent)]
  Containers(#[from] ContainerError),

  /// A collaborator failed for reasons unrelated to the user's code.
  #[error("{context}")]
  Infrastructure {
    context: String,
    #[source]
    source: CollaboratorError,
  },

  /// A collaborator reported that the user's build failed.
  #[error("{0}")]
  Failed(String),

  /// One or more targets failed; `completed` holds what did build.
  #[error("{}", describe_failures(.failures))]
  TargetsFailed {
    failures: Vec<TargetFailure>,
    completed: BuildResultSet,
  },
}

fn describe_failures(failures: &[TargetFailure]) -> String {
  let parts: Vec<String> = failures.iter().map(TargetFailure::to_string).collect();
  format!("build failed: {}", parts.join("; "))
}

impl BuildError {
  /// Redirect that is only logged at debug level.
  pub fn silent_redirect(message: impl Into<String>) -> Self {
    BuildError::Redirect {
      message: message.into(),
      level: RedirectLevel::Debug,
    }
  }

  pub fn info_redirect(message: impl Into<String>) -> Self {
    BuildError::Redirect {
      message: message.into(),
      level: RedirectLevel::Info,
    }
  }

  pub fn dont_fall_back(err: BuildError) -> Self {
    match err {
      BuildError::DontFallBack(_) => err,
      other => BuildError::DontFallBack(Box::new(other)),
    }
  }

  pub fn infrastructure(context: impl Into<String>, source: impl Into<CollaboratorError>) -> Self {
    BuildError::Infrastructure {
      context: context.into(),
      source: source.into(),
    }
  }

  pub fn is_redirect(&self) -> bool {
    matches!(self, BuildError::Redirect { .. })
  }

  pub fn is_dont_fall_back(&self) -> bool {
    matches!(
      self,
      BuildError::DontFallBack(_)
        | BuildError::RunStepFailure { .. }
        | BuildError::Failed(_)
        | BuildError::TargetsFailed { .. }
    )
  }

  pub fn is_fatal(&self) -> bool {
    match self {
      BuildError::Canceled => true,
      BuildError::DontFallBack(inner) => inner.is_fatal(),
      _ => false,
    }
  }

  /// Whether the composite chain should try its next strategy.
  pub fn should_fall_back(&self) -> bool {
    matches!(
      self,
      BuildError::Redirect { .. }
        | BuildError::InconsistentState(_)
        | BuildError::Plan(_)
        | BuildError::Containers(_)
        | BuildError::Infrastructure { .. }
        | BuildError::Queue(_)
    )
  }

  /// How this error affects the manifest's pending changes.
  pub fn failure_kind(&self) -> FailureKind {
    match self {
      e if e.is_fatal() => FailureKind::Fatal,
      BuildError::Infrastructure { .. } | BuildError::Queue(QueueError::ImageCheck { .. }) => {
        FailureKind::Infrastructure
      }
      _ => FailureKind::Build,
    }
  }
}
