//! Live update: patching running containers in place instead of rebuilding.

pub mod containers;
pub mod plan;

pub use containers::{
  Container, ContainerError, image_name, running_containers_for_compose, running_containers_for_pods,
};
pub use plan::{Cmd, LiveUpdatePlan, PathMapping, PlanError, boil_runs, missing_local_paths, plan, plan_with};
