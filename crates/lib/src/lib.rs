//! devloop-lib: the core of a continuous development loop.
//!
//! Watches nothing and runs nothing by itself. Given manifests and the events
//! reported by watchers and runtimes, it decides which manifest to build next
//! and how:
//! - `model`: targets, manifests and the dependency graph between targets
//! - `store`: the shared engine state and the reducers that update it
//! - `buildcontrol`: the scheduler, the target queue and the build strategies
//! - `liveupdate`: planning file syncs into running containers
//! - `engine`: the control loop tying these together

pub mod buildcontrol;
pub mod config;
pub mod engine;
pub mod liveupdate;
pub mod model;
pub mod store;
pub mod util;
