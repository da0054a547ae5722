//! Result reconciliation
//!
//! Derives the authoritative pass/fail counts of a finished run from the
//! artifacts the external runner left behind. The aggregate summary wins
//! when present; otherwise per-case result files are counted, skipping
//! fixtures and records that do not identify a test case.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::models::RunCounters;

/// Summary artifact, relative to the results root
pub const DEFAULT_SUMMARY_FILE: &str = "widgets/summary.json";

/// Suffix of per-case result files
pub const RESULT_FILE_SUFFIX: &str = "-result.json";

/// Name fragments that mark hooks and fixtures rather than test cases
const FIXTURE_MARKERS: &[&str] = &["before_", "after_", "setup", "teardown", "fixture"];

#[derive(Debug, Deserialize)]
struct SummaryArtifact {
    statistic: Statistic,
}

#[derive(Debug, Default, Deserialize)]
struct Statistic {
    #[serde(default)]
    passed: u64,
    #[serde(default)]
    failed: u64,
    #[serde(default)]
    broken: u64,
    #[serde(default)]
    total: Option<u64>,
}

/// One per-case result record
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultArtifact {
    pub name: Option<String>,
    pub status: Option<String>,
    pub full_name: Option<String>,
    /// `Some` whenever the key exists, whatever its value
    #[serde(default, deserialize_with = "present")]
    pub test_case_id: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub history_id: Option<Value>,
}

/// Keeps a present key as `Some`, including an explicit `null`
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ResultArtifact {
    fn is_fixture(&self) -> bool {
        [self.name.as_deref(), self.full_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::to_lowercase)
            .any(|text| FIXTURE_MARKERS.iter().any(|marker| text.contains(marker)))
    }

    fn has_identity(&self) -> bool {
        self.test_case_id.is_some() || self.history_id.is_some()
    }
}

/// Status vocabulary of result records
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaseStatus {
    Passed,
    Failed,
    Broken,
    Skipped,
    Unknown,
}

impl CaseStatus {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "passed" => CaseStatus::Passed,
            "failed" => CaseStatus::Failed,
            "broken" => CaseStatus::Broken,
            "skipped" => CaseStatus::Skipped,
            _ => CaseStatus::Unknown,
        }
    }
}

/// Where the counters came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountSource {
    Summary,
    ResultFiles,
    Empty,
}

impl fmt::Display for CountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountSource::Summary => write!(f, "summary"),
            CountSource::ResultFiles => write!(f, "result files"),
            CountSource::Empty => write!(f, "no artifacts"),
        }
    }
}

/// Outcome of one reconciliation
#[derive(Clone, Debug, Serialize)]
pub struct Reconciliation {
    pub counters: RunCounters,
    pub source: CountSource,
    /// Total as written in the summary, when it was used
    pub declared_total: Option<u64>,
    /// Records with a status other than passed/failed/broken
    pub skipped: u64,
    pub files_scanned: usize,
    /// Result files ignored as malformed, fixtures or unidentified
    pub files_rejected: usize,
}

impl Reconciliation {
    fn empty() -> Self {
        Self {
            counters: RunCounters::zero(),
            source: CountSource::Empty,
            declared_total: None,
            skipped: 0,
            files_scanned: 0,
            files_rejected: 0,
        }
    }
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (from {})", self.counters, self.source)?;
        if self.skipped > 0 {
            write!(f, " | Skipped: {}", self.skipped)?;
        }
        Ok(())
    }
}

/// Two-tier result counter
#[derive(Clone, Debug)]
pub struct Reconciler {
    summary_file: PathBuf,
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            summary_file: PathBuf::from(DEFAULT_SUMMARY_FILE),
        }
    }

    /// Summary location, relative to the results root unless absolute
    pub fn with_summary_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary_file = path.into();
        self
    }

    pub fn reconcile(&self, root: &Path) -> Reconciliation {
        if !root.exists() {
            debug!("Results root {} does not exist", root.display());
            return Reconciliation::empty();
        }

        if let Some(reconciled) = self.from_summary(root) {
            info!("Counts from summary: {}", reconciled.counters);
            return reconciled;
        }

        let reconciled = self.from_result_files(root);
        info!(
            "Counts from {} result file(s): {}",
            reconciled.files_scanned, reconciled.counters
        );
        reconciled
    }

    fn from_summary(&self, root: &Path) -> Option<Reconciliation> {
        let path = root.join(&self.summary_file);
        if !path.is_file() {
            return None;
        }

        let parsed = fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| {
                serde_json::from_str::<SummaryArtifact>(&text).map_err(|e| e.to_string())
            });

        let summary = match parsed {
            Ok(summary) => summary,
            Err(e) => {
                warn!(
                    "Unreadable summary {}: {}, counting result files",
                    path.display(),
                    e
                );
                return None;
            }
        };

        let stats = summary.statistic;
        let counters = RunCounters::new(stats.passed, stats.failed + stats.broken);
        if let Some(declared) = stats.total {
            if declared != counters.total() {
                warn!(
                    "Summary declares total {} but passed+failed+broken is {}",
                    declared,
                    counters.total()
                );
            }
        }

        Some(Reconciliation {
            counters,
            source: CountSource::Summary,
            declared_total: stats.total,
            ..Reconciliation::empty()
        })
    }

    fn from_result_files(&self, root: &Path) -> Reconciliation {
        let mut passed = 0;
        let mut failed = 0;
        let mut reconciled = Reconciliation::empty();

        for entry in WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.file_name().to_string_lossy().ends_with(RESULT_FILE_SUFFIX))
        {
            reconciled.files_scanned += 1;
            let Some(status) = read_case_status(entry.path()) else {
                reconciled.files_rejected += 1;
                continue;
            };

            match status {
                CaseStatus::Passed => passed += 1,
                CaseStatus::Failed | CaseStatus::Broken => failed += 1,
                CaseStatus::Skipped | CaseStatus::Unknown => reconciled.skipped += 1,
            }
        }

        if reconciled.files_scanned > 0 {
            reconciled.source = CountSource::ResultFiles;
        }
        reconciled.counters = RunCounters::new(passed, failed);
        reconciled
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

/// Status of a countable record, `None` when the file must be ignored
fn read_case_status(path: &Path) -> Option<CaseStatus> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            return None;
        }
    };
    let record: ResultArtifact = match serde_json::from_str(&text) {
        Ok(record) => record,
        Err(e) => {
            warn!("Skipping malformed result {}: {}", path.display(), e);
            return None;
        }
    };

    let status = match (&record.name, &record.status) {
        (Some(_), Some(status)) => CaseStatus::from_str(status),
        _ => {
            debug!("{} lacks name or status", path.display());
            return None;
        }
    };
    if record.is_fixture() {
        debug!("{} is a fixture record", path.display());
        return None;
    }
    if !record.has_identity() {
        debug!("{} has no test case identity", path.display());
        return None;
    }
    Some(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn reconcile(root: &Path) -> Reconciliation {
        Reconciler::default().reconcile(root)
    }

    fn write_json(path: &Path, value: serde_json::Value) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, value.to_string()).unwrap();
    }

    fn case(root: &Path, file: &str, name: &str, status: &str) {
        write_json(
            &root.join(file),
            json!({"name": name, "status": status, "testCaseId": format!("id-{file}")}),
        );
    }

    #[test]
    fn test_summary_preferred_over_result_files() {
        let dir = tempdir().unwrap();
        write_json(
            &dir.path().join(DEFAULT_SUMMARY_FILE),
            json!({"statistic": {"passed": 5, "failed": 1, "broken": 0, "skipped": 0, "total": 6}}),
        );
        for i in 0..10 {
            case(dir.path(), &format!("worker-0/{i}-result.json"), "login", "passed");
        }

        let reconciled = reconcile(dir.path());
        assert_eq!(reconciled.counters, RunCounters::new(5, 1));
        assert_eq!(reconciled.counters.total(), 6);
        assert_eq!(reconciled.source, CountSource::Summary);
        assert_eq!(reconciled.declared_total, Some(6));
    }

    #[test]
    fn test_broken_counts_as_failed_in_summary() {
        let dir = tempdir().unwrap();
        write_json(
            &dir.path().join(DEFAULT_SUMMARY_FILE),
            json!({"statistic": {"passed": 3, "failed": 1, "broken": 2, "total": 6}}),
        );

        let counters = reconcile(dir.path()).counters;
        assert_eq!((counters.passed(), counters.failed(), counters.total()), (3, 3, 6));
    }

    #[test]
    fn test_inconsistent_summary_total_is_not_trusted() {
        let dir = tempdir().unwrap();
        write_json(
            &dir.path().join(DEFAULT_SUMMARY_FILE),
            json!({"statistic": {"passed": 4, "failed": 1, "broken": 0, "skipped": 3, "total": 8}}),
        );

        let reconciled = reconcile(dir.path());
        assert_eq!(reconciled.counters.total(), 5);
        assert_eq!(reconciled.declared_total, Some(8));
    }

    #[test]
    fn test_result_file_fallback_filters_records() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        case(root, "worker-0/a-result.json", "Login works", "passed");
        case(root, "worker-1/b-result.json", "Logout works", "passed");
        case(root, "worker-1/c-result.json", "Checkout", "broken");
        case(root, "worker-0/d-result.json", "Search", "skipped");
        case(root, "worker-0/e-result.json", "before_feature", "passed");
        write_json(
            &root.join("worker-2/f-result.json"),
            json!({"name": "Cart", "status": "failed", "fullName": "features/cart.feature:Teardown hook", "historyId": "h"}),
        );
        write_json(
            &root.join("worker-2/g-result.json"),
            json!({"name": "Orphan", "status": "failed"}),
        );
        write_json(
            &root.join("worker-2/h-result.json"),
            json!({"name": "No status", "testCaseId": "x"}),
        );
        fs::write(root.join("worker-2/i-result.json"), "{not json").unwrap();
        write_json(&root.join("worker-2/container.json"), json!({"name": "ignored"}));

        let reconciled = reconcile(root);
        assert_eq!(reconciled.counters, RunCounters::new(2, 1));
        assert_eq!(reconciled.counters.total(), 3);
        assert_eq!(reconciled.source, CountSource::ResultFiles);
        assert_eq!(reconciled.skipped, 1);
        assert_eq!(reconciled.files_scanned, 9);
        assert_eq!(reconciled.files_rejected, 5);
    }

    #[test]
    fn test_history_id_alone_identifies_case() {
        let dir = tempdir().unwrap();
        write_json(
            &dir.path().join("x-result.json"),
            json!({"name": "Pay", "status": "failed", "historyId": "abc"}),
        );
        assert_eq!(reconcile(dir.path()).counters, RunCounters::new(0, 1));
    }

    #[test]
    fn test_identity_key_presence_is_enough() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_json(
            &root.join("a-result.json"),
            json!({"name": "Null id", "status": "passed", "testCaseId": null}),
        );
        write_json(
            &root.join("b-result.json"),
            json!({"name": "Numeric id", "status": "failed", "historyId": 42}),
        );
        write_json(
            &root.join("c-result.json"),
            json!({"name": "Object id", "status": "passed", "testCaseId": {"uuid": "x"}}),
        );
        write_json(
            &root.join("d-result.json"),
            json!({"name": "No id", "status": "passed"}),
        );

        let reconciled = reconcile(root);
        assert_eq!(reconciled.counters, RunCounters::new(2, 1));
        assert_eq!(reconciled.files_rejected, 1);
    }

    #[test]
    fn test_unreadable_summary_falls_back() {
        let dir = tempdir().unwrap();
        let summary = dir.path().join(DEFAULT_SUMMARY_FILE);
        fs::create_dir_all(summary.parent().unwrap()).unwrap();
        fs::write(&summary, "garbage").unwrap();
        case(dir.path(), "a-result.json", "Login", "passed");

        let reconciled = reconcile(dir.path());
        assert_eq!(reconciled.source, CountSource::ResultFiles);
        assert_eq!(reconciled.counters, RunCounters::new(1, 0));
    }

    #[test]
    fn test_custom_summary_location() {
        let dir = tempdir().unwrap();
        write_json(
            &dir.path().join("stats.json"),
            json!({"statistic": {"passed": 1, "failed": 0, "broken": 0}}),
        );

        let reconciled = Reconciler::new()
            .with_summary_file("stats.json")
            .reconcile(dir.path());
        assert_eq!(reconciled.source, CountSource::Summary);
        assert_eq!(reconciled.declared_total, None);
    }

    #[test]
    fn test_missing_root_yields_zero() {
        let dir = tempdir().unwrap();
        let reconciled = reconcile(&dir.path().join("nope"));
        assert!(reconciled.counters.is_zero());
        assert_eq!(reconciled.source, CountSource::Empty);
    }
}
