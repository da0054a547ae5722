//! Configuration file management
//!
//! Handles finding, loading, and validating configuration files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{AppConfig, EnvConfig};
use crate::executor::CommandTemplate;

/// Configuration file locations (in order of precedence)
const CONFIG_LOCATIONS: &[&str] = &[
    "./scenario-runner.yaml",
    "./scenario-runner.yml",
    "./.scenario-runner.yaml",
    "~/.config/scenario-runner/config.yaml",
];

const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// Full configuration file structure
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Version of config file format
    #[serde(default = "default_version")]
    pub version: String,

    /// Application settings
    #[serde(default)]
    pub app: AppConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
        }
    }
}

impl ConfigFile {
    /// Find configuration file in standard locations
    pub fn find() -> Option<PathBuf> {
        CONFIG_LOCATIONS
            .iter()
            .map(|location| expand_path(location))
            .find(|path| path.exists())
    }

    /// Resolve the effective configuration.
    ///
    /// An explicit path wins over `SCENARIO_RUNNER_CONFIG`, which wins over the
    /// standard locations. Environment overrides are applied on top and the
    /// result is validated again.
    pub fn resolve(explicit: Option<&Path>, env: &EnvConfig) -> Result<(AppConfig, Option<PathBuf>)> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| env.config_file.as_deref().map(expand_path))
            .or_else(Self::find);

        let file = match &path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        let mut app = file.app;
        app.apply_env(env);
        app.validate().context("Invalid configuration after environment overrides")?;
        Ok((app, path))
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            anyhow::bail!("Unsupported config version: {}", self.version);
        }
        self.app.validate()
    }

    /// Generate example configuration
    pub fn example() -> Self {
        let mut app = AppConfig {
            workers: 4,
            tags: Some("not @wip".to_string()),
            timeout_secs: 600,
            ..AppConfig::default()
        };
        app.commands.scenario = CommandTemplate::new(
            "behave",
            [
                "{scenario}",
                "--no-capture",
                "--no-color",
                "-f",
                "allure_behave.formatter:AllureFormatter",
                "-o",
                "{output_dir}",
            ],
        );
        app.env.set.insert("BROWSER".to_string(), "chromium".to_string());

        Self {
            version: default_version(),
            app,
        }
    }
}

/// Expand ~ to home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Check if path is a YAML file
fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();
        assert_eq!(config.version, "1.0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_example_config() {
        let config = ConfigFile::example();
        assert!(config.validate().is_ok());
        assert_eq!(config.app.workers, 4);
    }

    #[test]
    fn test_expand_path() {
        let path = expand_path("~/test");
        assert!(!path.to_string_lossy().starts_with("~") || dirs::home_dir().is_none());

        let path = expand_path("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_is_yaml_file() {
        assert!(is_yaml_file(Path::new("config.yaml")));
        assert!(is_yaml_file(Path::new("config.yml")));
        assert!(!is_yaml_file(Path::new("config.json")));
    }

    #[test]
    fn test_save_and_load_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/scenario-runner.yaml");

        ConfigFile::example().save(&path).unwrap();
        let loaded = ConfigFile::load(&path).unwrap();

        assert_eq!(loaded.app.workers, 4);
        assert_eq!(loaded.app.tags.as_deref(), Some("not @wip"));
        assert_eq!(
            loaded.app.env.set.get("BROWSER").map(String::as_str),
            Some("chromium")
        );
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempdir().unwrap();

        let version = dir.path().join("v.json");
        std::fs::write(&version, r#"{"version": "9.9"}"#).unwrap();
        assert!(ConfigFile::load(&version).is_err());

        let workers = dir.path().join("w.yaml");
        std::fs::write(&workers, "app:\n  workers: 0\n").unwrap();
        assert!(ConfigFile::load(&workers).is_err());
    }

    #[test]
    fn test_resolve_applies_env() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runner.yaml");
        std::fs::write(&path, "app:\n  workers: 2\n  grace_secs: 9\n").unwrap();

        let env = EnvConfig {
            workers: Some(5),
            ..Default::default()
        };
        let (app, used) = ConfigFile::resolve(Some(&path), &env).unwrap();

        assert_eq!(used.as_deref(), Some(path.as_path()));
        assert_eq!(app.workers, 5);
        assert_eq!(app.grace_secs, 9);
    }

    #[test]
    fn test_resolve_rejects_invalid_env() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runner.yaml");
        std::fs::write(&path, "version: \"1.0\"\n").unwrap();

        let env = EnvConfig {
            workers: Some(0),
            ..Default::default()
        };
        assert!(ConfigFile::resolve(Some(&path), &env).is_err());
    }
}
