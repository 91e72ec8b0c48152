//! Scheduler for cadence workflow executions.
//!
//! This crate provides:
//!
//! - **Poller**: An interval loop that atomically claims due execution
//!   cursors and drives each through the step runner
//! - **Tick Summaries**: Per-poll counts of step outcomes for logging
//!   and tests

pub mod poller;

pub use poller::{Poller, PollerConfig, TickSummary};
