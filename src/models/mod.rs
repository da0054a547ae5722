//! Data models for scenario orchestration
//!
//! This module contains all data structures shared between discovery,
//! execution, reconciliation and the run controller.

mod execution;
mod scenario;

pub use execution::{
    ExecutionResult, ExecutionStatus, RunCounters, RunSummary, KILLED_EXIT_CODE,
};
pub use scenario::ScenarioRef;
