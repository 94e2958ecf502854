//! Engine state and build bookkeeping.
//!
//! The store holds everything the scheduler reads and the build loop writes:
//!
//! - per-target build results and pending changes ([`BuildStatus`])
//! - per-manifest build history and runtime status ([`ManifestState`])
//! - the manual trigger queue and config-file reload state ([`EngineState`])
//!
//! [`SharedEngineState`] wraps the state in a lock; [`reducers`] are the only
//! functions that mutate it.

pub mod build_result;
pub mod engine_state;
pub mod hold;
pub mod reducers;
pub mod runtime;
pub mod shared;

pub use build_result::{BuildResult, BuildResultSet, BuildState, BuildStateSet};
pub use engine_state::{
  BuildReason, BuildRecord, BuildStatus, ConfigFileState, DisableState, EngineState, LiveUpdateStatus, ManifestState,
  ManifestTarget, is_live_update_eligible_trigger,
};
pub use hold::{Hold, HoldReason, HoldSet};
pub use reducers::{BuildCompleted, BuildFailure, FailureKind};
pub use runtime::{ContainerStatus, Pod, PodPhase, RuntimeState, RuntimeStatus};
pub use shared::SharedEngineState;
