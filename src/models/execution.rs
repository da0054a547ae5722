//! Execution result models
//!
//! Defines the outcome of one scenario run, the run counters shown to
//! consumers, and the per-run summary used by the CLI.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exit code recorded when a process was killed or never started
pub const KILLED_EXIT_CODE: i32 = -1;

/// Scenario execution status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "✓",
            ExecutionStatus::Failure => "✗",
            ExecutionStatus::Timeout => "⏱",
            ExecutionStatus::Cancelled => "○",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "PASS"),
            ExecutionStatus::Failure => write!(f, "FAIL"),
            ExecutionStatus::Timeout => write!(f, "TIMEOUT"),
            ExecutionStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Outcome of a single dispatched scenario
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub scenario: String,
    pub worker_id: usize,
    pub status: ExecutionStatus,
    pub exit_code: i32,
    /// Combined stdout and stderr in program order
    pub output: String,
    pub duration_ms: u64,
    pub message: Option<String>,
}

impl ExecutionResult {
    /// Build a result from a process exit code
    pub fn from_exit(
        scenario: impl Into<String>,
        worker_id: usize,
        exit_code: i32,
        duration_ms: u64,
    ) -> Self {
        let status = if exit_code == 0 {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failure
        };
        Self {
            scenario: scenario.into(),
            worker_id,
            status,
            exit_code,
            output: String::new(),
            duration_ms,
            message: None,
        }
    }

    pub fn timeout(scenario: impl Into<String>, worker_id: usize, duration_ms: u64) -> Self {
        Self {
            scenario: scenario.into(),
            worker_id,
            status: ExecutionStatus::Timeout,
            exit_code: KILLED_EXIT_CODE,
            output: String::new(),
            duration_ms,
            message: Some(format!("killed after {duration_ms}ms")),
        }
    }

    pub fn cancelled(scenario: impl Into<String>, worker_id: usize, duration_ms: u64) -> Self {
        Self {
            scenario: scenario.into(),
            worker_id,
            status: ExecutionStatus::Cancelled,
            exit_code: KILLED_EXIT_CODE,
            output: String::new(),
            duration_ms,
            message: Some("stopped on request".to_string()),
        }
    }

    /// The process could not be started at all
    pub fn spawn_failed(
        scenario: impl Into<String>,
        worker_id: usize,
        error: impl Into<String>,
    ) -> Self {
        Self {
            scenario: scenario.into(),
            worker_id,
            status: ExecutionStatus::Failure,
            exit_code: KILLED_EXIT_CODE,
            output: String::new(),
            duration_ms: 0,
            message: Some(error.into()),
        }
    }

    pub fn with_output(mut self, output: String) -> Self {
        self.output = output;
        self
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [worker {}] [{}ms]",
            self.status.symbol(),
            self.scenario,
            self.worker_id,
            self.duration_ms
        )?;
        if let Some(msg) = &self.message {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}

/// Externally visible score of the current run.
///
/// Only constructible from `(passed, failed)`, so `total` can never drift.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    passed: u64,
    failed: u64,
    total: u64,
}

impl RunCounters {
    pub fn new(passed: u64, failed: u64) -> Self {
        Self {
            passed,
            failed,
            total: passed + failed,
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn passed(&self) -> u64 {
        self.passed
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_zero(&self) -> bool {
        self.total == 0
    }
}

impl fmt::Display for RunCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Passed: {} | Failed: {} | Total: {}",
            self.passed, self.failed, self.total
        )
    }
}

/// Tally of the execution results of one run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub total_duration_ms: u64,
    pub results: Vec<ExecutionResult>,
}

impl RunSummary {
    pub fn new(results: Vec<ExecutionResult>) -> Self {
        let count = |status: ExecutionStatus| results.iter().filter(|r| r.status == status).count();

        Self {
            total: results.len(),
            passed: count(ExecutionStatus::Success),
            failed: count(ExecutionStatus::Failure),
            timed_out: count(ExecutionStatus::Timeout),
            cancelled: count(ExecutionStatus::Cancelled),
            total_duration_ms: results.iter().map(|r| r.duration_ms).sum(),
            results,
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.passed as f64 / self.total as f64) * 100.0
        }
    }

    /// Every dispatched scenario passed and at least one ran
    pub fn is_all_passed(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }

    pub fn unsuccessful(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| !r.status.is_success())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for result in &self.results {
            writeln!(f, "  {result}")?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        writeln!(
            f,
            "Total: {} | Pass: {} | Fail: {} | Timeout: {} | Cancelled: {}",
            self.total, self.passed, self.failed, self.timed_out, self.cancelled
        )?;
        writeln!(
            f,
            "Pass Rate: {:.1}% | Duration: {}ms",
            self.pass_rate(),
            self.total_duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_exit_code() {
        assert!(ExecutionResult::from_exit("a.feature:1", 0, 0, 10)
            .status
            .is_success());
        let failed = ExecutionResult::from_exit("a.feature:1", 0, 2, 10);
        assert_eq!(failed.status, ExecutionStatus::Failure);
        assert_eq!(failed.exit_code, 2);
    }

    #[test]
    fn test_timeout_uses_sentinel_exit_code() {
        let result = ExecutionResult::timeout("a.feature:1", 1, 500);
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.exit_code, KILLED_EXIT_CODE);
    }

    #[test]
    fn test_counters_total_is_derived() {
        let counters = RunCounters::new(5, 1);
        assert_eq!(counters.total(), 6);
        assert_eq!(counters.total(), counters.passed() + counters.failed());
        assert!(RunCounters::zero().is_zero());
    }

    #[test]
    fn test_run_summary() {
        let results = vec![
            ExecutionResult::from_exit("a.feature:1", 0, 0, 100),
            ExecutionResult::from_exit("a.feature:9", 1, 1, 50),
            ExecutionResult::timeout("b.feature:4", 0, 300),
            ExecutionResult::spawn_failed("c.feature:2", 1, "No such file"),
        ];

        let summary = RunSummary::new(results);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.unsuccessful().count(), 3);
        assert!(!summary.is_all_passed());
    }

    #[test]
    fn test_empty_summary_is_not_a_pass() {
        let summary = RunSummary::new(Vec::new());
        assert!(!summary.is_all_passed());
        assert_eq!(summary.pass_rate(), 0.0);
    }
}
