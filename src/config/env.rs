//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

/// Environment variable prefix
const ENV_PREFIX: &str = "SCENARIO_RUNNER";

/// Worker count variable understood by older tooling
const LEGACY_WORKERS_VAR: &str = "PARALLEL_WORKERS";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Workers from SCENARIO_RUNNER_WORKERS or PARALLEL_WORKERS
    pub workers: Option<usize>,
    /// Scenario timeout from SCENARIO_RUNNER_TIMEOUT
    pub timeout: Option<u64>,
    /// Grace window from SCENARIO_RUNNER_GRACE
    pub grace: Option<u64>,
    /// Results root from SCENARIO_RUNNER_RESULTS_DIR
    pub results_dir: Option<String>,
    /// Corpus directory from SCENARIO_RUNNER_CORPUS
    pub corpus: Option<String>,
    /// Tag expression from SCENARIO_RUNNER_TAGS
    pub tags: Option<String>,
    /// Config file from SCENARIO_RUNNER_CONFIG
    pub config_file: Option<String>,
    /// Verbose from SCENARIO_RUNNER_VERBOSE
    pub verbose: Option<bool>,
    /// Log level from SCENARIO_RUNNER_LOG_LEVEL
    pub log_level: Option<String>,
    /// Output format from SCENARIO_RUNNER_FORMAT
    pub format: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}_{name}"));
        let parse_usize = |v: String| v.trim().parse::<usize>().ok();
        let parse_u64 = |v: String| v.trim().parse::<u64>().ok();

        Self {
            workers: get("WORKERS")
                .and_then(parse_usize)
                .or_else(|| lookup(LEGACY_WORKERS_VAR).and_then(parse_usize)),
            timeout: get("TIMEOUT").and_then(parse_u64),
            grace: get("GRACE").and_then(parse_u64),
            results_dir: get("RESULTS_DIR"),
            corpus: get("CORPUS"),
            tags: get("TAGS").filter(|t| !t.trim().is_empty()),
            config_file: get("CONFIG"),
            verbose: get("VERBOSE").map(|v| parse_bool(&v)),
            log_level: get("LOG_LEVEL").filter(|l| !l.trim().is_empty()),
            format: get("FORMAT"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.workers.is_some()
            || self.timeout.is_some()
            || self.grace.is_some()
            || self.results_dir.is_some()
            || self.corpus.is_some()
            || self.tags.is_some()
            || self.config_file.is_some()
            || self.verbose.is_some()
            || self.log_level.is_some()
            || self.format.is_some()
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {}_WORKERS:     {:?}", ENV_PREFIX, self.workers);
        println!("  {}_TIMEOUT:     {:?}", ENV_PREFIX, self.timeout);
        println!("  {}_GRACE:       {:?}", ENV_PREFIX, self.grace);
        println!("  {}_RESULTS_DIR: {:?}", ENV_PREFIX, self.results_dir);
        println!("  {}_CORPUS:      {:?}", ENV_PREFIX, self.corpus);
        println!("  {}_TAGS:        {:?}", ENV_PREFIX, self.tags);
        println!("  {}_CONFIG:      {:?}", ENV_PREFIX, self.config_file);
        println!("  {}_VERBOSE:     {:?}", ENV_PREFIX, self.verbose);
        println!("  {}_LOG_LEVEL:   {:?}", ENV_PREFIX, self.log_level);
        println!("  {}_FORMAT:      {:?}", ENV_PREFIX, self.format);
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "enabled"
    )
}

/// Builder for setting environment variables in tests
#[cfg(test)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

#[cfg(test)]
impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    /// Set `SCENARIO_RUNNER_<name>`
    pub fn var(mut self, name: &str, value: impl Into<String>) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_{name}"), value.into()));
        self
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        for (key, value) in self.vars {
            env::set_var(key, value);
        }

        EnvGuard { previous }
    }
}

/// Guard that restores environment variables on drop
#[cfg(test)]
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

#[cfg(test)]
impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Print all SCENARIO_RUNNER environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_WORKERS      Number of parallel workers (1 = sequential)");
    println!("  {LEGACY_WORKERS_VAR}          Same as {ENV_PREFIX}_WORKERS");
    println!("  {ENV_PREFIX}_TIMEOUT      Per-scenario timeout in seconds (0 = none)");
    println!("  {ENV_PREFIX}_GRACE        Seconds between SIGTERM and SIGKILL on stop");
    println!("  {ENV_PREFIX}_RESULTS_DIR  Results root directory");
    println!("  {ENV_PREFIX}_CORPUS       Directory containing the features");
    println!("  {ENV_PREFIX}_TAGS         Default tag expression");
    println!("  {ENV_PREFIX}_CONFIG       Path to configuration file");
    println!("  {ENV_PREFIX}_VERBOSE      Enable verbose output (true/false)");
    println!("  {ENV_PREFIX}_LOG_LEVEL    Log level (trace, debug, info, warn, error)");
    println!("  {ENV_PREFIX}_FORMAT       Output format (table, json, csv, summary)");
    println!();
    println!("Forwarded to scenario processes when set:");
    for name in crate::executor::EnvForwarding::default().forward {
        println!("  {name}");
    }
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_WORKERS=4");
    println!("  export {ENV_PREFIX}_TAGS=@smoke");
    println!("  scenario-runner run");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.workers.is_none());
        assert!(!config.has_any());
    }

    #[test]
    fn test_from_lookup() {
        let config = EnvConfig::from_lookup(lookup(&[
            ("SCENARIO_RUNNER_WORKERS", "4"),
            ("SCENARIO_RUNNER_TIMEOUT", "90"),
            ("SCENARIO_RUNNER_VERBOSE", "yes"),
            ("SCENARIO_RUNNER_TAGS", "  "),
            ("SCENARIO_RUNNER_LOG_LEVEL", "warn"),
        ]));

        assert_eq!(config.workers, Some(4));
        assert_eq!(config.timeout, Some(90));
        assert_eq!(config.verbose, Some(true));
        assert!(config.tags.is_none());
        assert_eq!(config.log_level.as_deref(), Some("warn"));
        assert!(config.has_any());
    }

    #[test]
    fn test_legacy_workers_variable() {
        let legacy = EnvConfig::from_lookup(lookup(&[("PARALLEL_WORKERS", "5")]));
        assert_eq!(legacy.workers, Some(5));

        let both = EnvConfig::from_lookup(lookup(&[
            ("PARALLEL_WORKERS", "5"),
            ("SCENARIO_RUNNER_WORKERS", "2"),
        ]));
        assert_eq!(both.workers, Some(2));
    }

    #[test]
    fn test_unparseable_numbers_are_ignored() {
        let config = EnvConfig::from_lookup(lookup(&[("SCENARIO_RUNNER_WORKERS", "many")]));
        assert!(config.workers.is_none());
    }

    #[test]
    fn test_env_builder() {
        let _guard = EnvBuilder::new()
            .var("RESULTS_DIR", "/tmp/scenario-runner-env-test")
            .var("GRACE", "7")
            .apply_scoped();

        let config = EnvConfig::load();
        assert_eq!(
            config.results_dir.as_deref(),
            Some("/tmp/scenario-runner-env-test")
        );
        assert_eq!(config.grace, Some(7));
    }
}
