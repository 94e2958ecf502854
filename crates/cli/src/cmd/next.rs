//! Implementation of the `devloop next` command.
//!
//! Runs the scheduler once over a state snapshot and reports which manifest
//! it would build and why every other manifest is held.

use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use devloop_lib::buildcontrol::next_target_to_build;
use devloop_lib::config::EngineConfig;
use devloop_lib::model::ManifestName;
use devloop_lib::store::{EngineState, HoldSet};

use super::load_state;
use crate::output::{OutputFormat, format_age, print_info, print_item, print_json, print_success, symbols};

#[derive(Debug, Serialize)]
struct NextOutput {
  next: Option<String>,
  reason: Option<String>,
  at_parallel_limit: bool,
  building: Vec<String>,
  holds: HoldSet,
}

pub fn cmd_next(state_path: &Path, config: &EngineConfig, output: OutputFormat) -> Result<()> {
  let state = load_state(state_path)?.state;
  let result = schedule(&state, config);

  if output.is_json() {
    return print_json(&result);
  }

  for name in &result.building {
    print_info(&format!("{name} is building"));
  }
  match (&result.next, &result.reason) {
    (Some(name), Some(reason)) => {
      print_success(&format!("Next: {name} ({reason})"));
      if let Some(since) = state
        .manifest_target(&ManifestName::new(name.as_str()))
        .and_then(|mt| mt.state.earliest_pending_change())
      {
        println!("  pending for {}", format_age(since, Utc::now()));
      }
    }
    _ if result.at_parallel_limit => print_info(&format!(
      "Nothing started: {} of {} parallel updates in use",
      result.building.len(),
      config.max_parallel_updates
    )),
    _ => print_info("Nothing to build"),
  }

  if !result.holds.is_empty() {
    println!();
    println!("Holds:");
    for (name, hold) in result.holds.iter() {
      print_item(symbols::MINUS, name.as_str(), Some(&hold.to_string()));
    }
  }
  Ok(())
}

fn schedule(state: &EngineState, config: &EngineConfig) -> NextOutput {
  let building: Vec<String> = state.currently_building().iter().map(|n| n.to_string()).collect();
  let at_parallel_limit = building.len() >= config.max_parallel_updates;

  let (next, holds) = next_target_to_build(state);
  debug!(holds = holds.len(), "scheduler ran");
  let next = next.filter(|_| !at_parallel_limit);

  NextOutput {
    next: next.map(|mt| mt.name().to_string()),
    reason: next.map(|mt| state.next_build_reason(mt).to_string()),
    at_parallel_limit,
    building,
    holds,
  }
}
