//! Configuration module
//!
//! Handles loading and managing configuration.

mod env;
mod file;

pub use env::{print_env_help, EnvConfig};
pub use file::ConfigFile;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::controller::output::{DEFAULT_BATCH_SIZE, DEFAULT_WINDOW_CAPACITY};
use crate::controller::RunSettings;
use crate::discovery::{DiscoveryMode, DEFAULT_DISCOVERY_TIMEOUT};
use crate::executor::{CommandTemplate, EnvForwarding, DEFAULT_WORKERS};
use crate::output::OutputFormat;
use crate::results::DEFAULT_SUMMARY_FILE;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory the runner is started in
    pub corpus_dir: PathBuf,

    /// Results root, purged at every start
    pub results_dir: PathBuf,

    /// Worker count; 1 selects a single sequential run
    pub workers: usize,

    /// Default tag expression
    pub tags: Option<String>,

    /// Per-scenario hard timeout in seconds, 0 disables
    pub timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL on stop
    pub grace_secs: u64,

    /// Summary artifact relative to the results root
    pub summary_file: PathBuf,

    /// Default output format
    pub format: String,

    /// Scenario discovery
    pub discovery: DiscoveryConfig,

    /// Runner invocations
    pub commands: CommandConfig,

    /// Environment handed to scenario processes
    pub env: EnvForwarding,

    /// Output streaming
    pub stream: StreamConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            corpus_dir: PathBuf::from("."),
            results_dir: PathBuf::from("reports/allure-results"),
            workers: DEFAULT_WORKERS,
            tags: None,
            timeout_secs: 300,
            grace_secs: 5,
            summary_file: PathBuf::from(DEFAULT_SUMMARY_FILE),
            format: "table".to_string(),
            discovery: DiscoveryConfig::default(),
            commands: CommandConfig::default(),
            env: EnvForwarding::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl AppConfig {
    /// Check values that would make a run impossible
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.grace_secs == 0 {
            anyhow::bail!("grace_secs must be positive");
        }
        for (name, template) in [
            ("discovery.command", &self.discovery.command),
            ("commands.scenario", &self.commands.scenario),
            ("commands.corpus", &self.commands.corpus),
        ] {
            if template.program.trim().is_empty() {
                anyhow::bail!("{} has an empty program", name);
            }
        }
        if !self.commands.scenario.args.iter().any(|a| a.contains("{scenario}")) {
            anyhow::bail!("commands.scenario must reference {{scenario}}");
        }
        if OutputFormat::from_str(&self.format).is_none() {
            anyhow::bail!("Unknown output format: {}", self.format);
        }
        if self.stream.batch_size == 0 || self.stream.window == 0 {
            anyhow::bail!("stream.batch_size and stream.window must be positive");
        }
        Ok(())
    }

    /// Layer environment overrides on top
    pub fn apply_env(&mut self, env: &EnvConfig) {
        if let Some(workers) = env.workers {
            self.workers = workers;
        }
        if let Some(timeout) = env.timeout {
            self.timeout_secs = timeout;
        }
        if let Some(grace) = env.grace {
            self.grace_secs = grace;
        }
        if let Some(dir) = &env.results_dir {
            self.results_dir = PathBuf::from(dir);
        }
        if let Some(dir) = &env.corpus {
            self.corpus_dir = PathBuf::from(dir);
        }
        if let Some(tags) = &env.tags {
            self.tags = Some(tags.clone());
        }
        if let Some(format) = &env.format {
            self.format = format.clone();
        }
    }

    pub fn scenario_timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    /// Controller settings derived from this configuration
    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            corpus_dir: self.corpus_dir.clone(),
            results_root: self.results_dir.clone(),
            discovery: self.discovery.mode,
            discovery_command: self.discovery.command.clone(),
            discovery_timeout: Duration::from_secs(self.discovery.timeout_secs),
            scenario_command: self.commands.scenario.clone(),
            corpus_command: self.commands.corpus.clone(),
            env: self.env.clone(),
            scenario_timeout: self.scenario_timeout(),
            grace: self.grace(),
            summary_file: self.summary_file.clone(),
            batch_size: self.stream.batch_size,
            window_capacity: self.stream.window,
        }
    }
}

/// Scenario discovery settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub mode: DiscoveryMode,
    /// Dry-run invocation; `--tags` is appended when filtering
    pub command: CommandTemplate,
    pub timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::DryRun,
            command: CommandTemplate::behave_dry_run(),
            timeout_secs: DEFAULT_DISCOVERY_TIMEOUT.as_secs(),
        }
    }
}

/// Runner invocation templates
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// One scenario on a pooled worker
    pub scenario: CommandTemplate,
    /// Whole corpus in sequential mode
    pub corpus: CommandTemplate,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            scenario: CommandTemplate::behave_scenario(),
            corpus: CommandTemplate::behave_corpus(),
        }
    }
}

/// Output streaming limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Lines drained per poll
    pub batch_size: usize,
    /// Lines kept for late readers
    pub window: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            window: DEFAULT_WINDOW_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.workers, 3);
        assert_eq!(config.scenario_timeout(), Some(Duration::from_secs(300)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_disables() {
        let config = AppConfig {
            timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.scenario_timeout(), None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.workers = 2;
        config.commands.scenario = CommandTemplate::new("behave", ["--no-capture"]);
        assert!(config.validate().is_err());

        config.commands = CommandConfig::default();
        config.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        let env = EnvConfig {
            workers: Some(6),
            timeout: Some(60),
            tags: Some("@smoke".to_string()),
            results_dir: Some("out".to_string()),
            ..Default::default()
        };
        config.apply_env(&env);

        assert_eq!(config.workers, 6);
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.tags.as_deref(), Some("@smoke"));
        assert_eq!(config.results_dir, PathBuf::from("out"));
        assert_eq!(config.grace_secs, 5);
    }

    #[test]
    fn test_run_settings() {
        let config = AppConfig {
            grace_secs: 2,
            ..Default::default()
        };
        let settings = config.run_settings();
        assert_eq!(settings.grace, Duration::from_secs(2));
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.results_root, config.results_dir);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: AppConfig = serde_yaml::from_str("workers: 8\ndiscovery:\n  mode: feature-scan\n").unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.discovery.mode, DiscoveryMode::FeatureScan);
        assert_eq!(config.commands.scenario.program, "behave");
    }
}
