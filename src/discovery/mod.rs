//! Scenario discovery
//!
//! Lists the runnable scenarios of a corpus, either by asking the runner for
//! a dry run or by scanning feature files directly.

mod parser;

pub use parser::{parse_dry_run, scan_feature};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::executor::{CommandTemplate, ExecOptions, Supervisor};
use crate::models::{ExecutionStatus, ScenarioRef};

/// Upper bound for a dry run
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(120);

/// How scenarios are listed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMode {
    /// Parse the runner's dry-run listing
    #[default]
    DryRun,
    /// Walk `*.feature` files for scenario keywords
    FeatureScan,
}

impl DiscoveryMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "dry-run" | "dryrun" | "dry_run" => Some(DiscoveryMode::DryRun),
            "feature-scan" | "scan" | "feature_scan" => Some(DiscoveryMode::FeatureScan),
            _ => None,
        }
    }
}

impl fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryMode::DryRun => write!(f, "dry-run"),
            DiscoveryMode::FeatureScan => write!(f, "feature-scan"),
        }
    }
}

/// Scenario discoverer for one corpus
#[derive(Clone, Debug)]
pub struct Discoverer {
    supervisor: Supervisor,
    corpus_root: PathBuf,
    mode: DiscoveryMode,
    command: CommandTemplate,
    timeout: Duration,
}

impl Discoverer {
    pub fn new(supervisor: Supervisor, corpus_root: impl Into<PathBuf>) -> Self {
        Self {
            supervisor,
            corpus_root: corpus_root.into(),
            mode: DiscoveryMode::default(),
            command: CommandTemplate::behave_dry_run(),
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    pub fn with_mode(mut self, mode: DiscoveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_command(mut self, command: CommandTemplate) -> Self {
        self.command = command;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn corpus_root(&self) -> &Path {
        &self.corpus_root
    }

    /// Ordered, duplicate-free scenarios. Empty when discovery failed.
    pub async fn discover(&self, tags: Option<&str>) -> Vec<ScenarioRef> {
        let tags = tags.map(str::trim).filter(|t| !t.is_empty());
        let scenarios = match self.mode {
            DiscoveryMode::DryRun => self.dry_run(tags).await,
            DiscoveryMode::FeatureScan => {
                if let Some(tags) = tags {
                    warn!("Tag filter {} is not applied by a feature scan", tags);
                }
                self.scan()
            }
        };

        let tags = tags.map(str::to_string);
        let scenarios: Vec<ScenarioRef> = scenarios
            .into_iter()
            .map(|s| s.with_tags(tags.clone()))
            .collect();

        info!(
            "Discovered {} scenario(s) in {} ({})",
            scenarios.len(),
            self.corpus_root.display(),
            self.mode
        );
        scenarios
    }

    async fn dry_run(&self, tags: Option<&str>) -> Vec<ScenarioRef> {
        let spec = self.command.plain(tags).current_dir(&self.corpus_root);
        debug!("Discovery command: {}", spec);

        let result = self
            .supervisor
            .execute(
                &spec,
                ExecOptions::default()
                    .with_timeout(Some(self.timeout))
                    .with_label("discovery"),
            )
            .await;

        match result.status {
            ExecutionStatus::Timeout | ExecutionStatus::Cancelled => {
                warn!("Discovery did not finish: {}", result);
                return Vec::new();
            }
            ExecutionStatus::Failure if result.message.is_some() && result.output.is_empty() => {
                warn!("Discovery failed: {}", result);
                return Vec::new();
            }
            _ => {}
        }

        let scenarios = parse_dry_run(&result.output);
        if scenarios.is_empty() && !result.status.is_success() {
            warn!(
                "Discovery exited with {} and listed nothing: {}",
                result.exit_code,
                result.output.lines().last().unwrap_or_default()
            );
        }
        scenarios
    }

    fn scan(&self) -> Vec<ScenarioRef> {
        let mut scenarios = Vec::new();

        for entry in WalkDir::new(&self.corpus_root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "feature"))
        {
            let path = entry.path();
            let relative = path.strip_prefix(&self.corpus_root).unwrap_or(path);
            match std::fs::read_to_string(path) {
                Ok(content) => scenarios.extend(scan_feature(relative, &content)),
                Err(e) => warn!("Cannot read {}: {}", path.display(), e),
            }
        }
        scenarios
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ProcessRegistry;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn supervisor() -> Supervisor {
        Supervisor::new(Arc::new(ProcessRegistry::new()))
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!(DiscoveryMode::from_str("dry-run"), Some(DiscoveryMode::DryRun));
        assert_eq!(DiscoveryMode::from_str("SCAN"), Some(DiscoveryMode::FeatureScan));
        assert_eq!(DiscoveryMode::from_str("magic"), None);
    }

    #[tokio::test]
    async fn test_feature_scan() {
        let dir = tempdir().unwrap();
        let features = dir.path().join("features");
        std::fs::create_dir_all(features.join("shop")).unwrap();
        std::fs::write(
            features.join("login.feature"),
            "Feature: Login\n  Scenario: ok\n  Scenario: bad\n",
        )
        .unwrap();
        std::fs::write(
            features.join("shop/cart.feature"),
            "Feature: Cart\n\n  Scenario Outline: add <item>\n",
        )
        .unwrap();
        std::fs::write(features.join("notes.txt"), "Scenario: not a feature").unwrap();

        let scenarios = Discoverer::new(supervisor(), dir.path())
            .with_mode(DiscoveryMode::FeatureScan)
            .discover(Some("@smoke"))
            .await;

        let locations: Vec<String> = scenarios.iter().map(|s| s.location()).collect();
        assert_eq!(
            locations,
            vec![
                "features/login.feature:2",
                "features/login.feature:3",
                "features/shop/cart.feature:3",
            ]
        );
        assert_eq!(scenarios[0].tags.as_deref(), Some("@smoke"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dry_run_listing() {
        let dir = tempdir().unwrap();
        let script = "echo 'Feature: A # features/a.feature:1'; \
                      echo '  Scenario: one # features/a.feature:3'; \
                      echo '  Scenario: two # features/a.feature:7' >&2";
        let scenarios = Discoverer::new(supervisor(), dir.path())
            .with_command(CommandTemplate::new("sh", ["-c", script]))
            .discover(None)
            .await;

        assert_eq!(scenarios.len(), 2);
        assert_eq!(scenarios[1].location(), "features/a.feature:7");
        assert!(scenarios[0].tags.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_dry_run_is_empty() {
        let dir = tempdir().unwrap();
        let discoverer = Discoverer::new(supervisor(), dir.path())
            .with_command(CommandTemplate::new("sh", ["-c", "echo 'ConfigError' >&2; exit 1"]));
        assert!(discoverer.discover(None).await.is_empty());

        let missing = Discoverer::new(supervisor(), dir.path())
            .with_command(CommandTemplate::new("scenario-runner-no-such-binary", Vec::<String>::new()));
        assert!(missing.discover(Some("@x")).await.is_empty());
    }
}
