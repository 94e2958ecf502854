//! Shared utilities.
//!
//! Path helpers used by the live-update planner and test fixtures.

pub mod ospath;

#[cfg(test)]
pub mod testutil;
