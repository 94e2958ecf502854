//! Engine state shared between the control loop and in-flight builds.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;

use super::engine_state::EngineState;

/// Handle to the single engine state.
///
/// Access is scoped to a closure so no reference to the state outlives the
/// lock. Every write wakes whoever is waiting in [`SharedEngineState::changed`].
#[derive(Debug, Clone, Default)]
pub struct SharedEngineState {
  inner: Arc<RwLock<EngineState>>,
  changed: Arc<Notify>,
}

impl SharedEngineState {
  pub fn new(state: EngineState) -> Self {
    Self {
      inner: Arc::new(RwLock::new(state)),
      changed: Arc::new(Notify::new()),
    }
  }

  pub fn read<R>(&self, f: impl FnOnce(&EngineState) -> R) -> R {
    let guard = self.inner.read();
    f(&guard)
  }

  pub fn write<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
    let result = {
      let mut guard = self.inner.write();
      f(&mut guard)
    };
    self.changed.notify_one();
    result
  }

  /// Wait until the next write.
  pub async fn changed(&self) {
    self.changed.notified().await;
  }

  /// Clone of the current state, e.g. for serializing.
  pub fn snapshot(&self) -> EngineState {
    self.read(Clone::clone)
  }
}
