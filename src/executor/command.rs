//! Execution command construction
//!
//! Turns configured argument templates into concrete command specs and
//! assembles the environment forwarded to every scenario process.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::models::ScenarioRef;

/// Variables forwarded to scenario processes when set in our environment
pub const DEFAULT_FORWARDED_VARS: &[&str] = &[
    "SELENIUM_REMOTE_URL",
    "SELENIUM_REMOTE",
    "HEADLESS",
    "IMPLICIT_WAIT",
    "PAGE_LOAD_TIMEOUT",
    "SCRIPT_TIMEOUT",
    "DEFAULT_TIMEOUT",
];

const REMOTE_URL_VAR: &str = "SELENIUM_REMOTE_URL";
const REMOTE_FLAG_VAR: &str = "SELENIUM_REMOTE";
pub const WORKER_ID_VAR: &str = "WORKER_ID";
pub const TAGS_VAR: &str = "TEST_TAGS";

/// A fully resolved command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: BTreeMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Program plus argument template.
///
/// Placeholders: `{scenario}`, `{output_dir}`, `{worker}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Default per-scenario invocation used by the worker pool
    pub fn behave_scenario() -> Self {
        Self::new(
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
        )
    }

    /// Default whole-corpus invocation used in sequential mode
    pub fn behave_corpus() -> Self {
        Self::new(
            "behave",
            [
                "-f",
                "plain",
                "-f",
                "allure_behave.formatter:AllureFormatter",
                "-o",
                "{output_dir}",
                "--no-capture",
                "--no-capture-stderr",
            ],
        )
    }

    /// Default dry-run used for discovery
    pub fn behave_dry_run() -> Self {
        Self::new(
            "behave",
            ["--dry-run", "--no-summary", "--no-capture", "--no-color"],
        )
    }

    fn render_args(&self, scenario: Option<&str>, output_dir: &Path, worker: Option<usize>) -> Vec<String> {
        let output_dir = output_dir.display().to_string();
        let worker = worker.map(|w| w.to_string()).unwrap_or_default();

        self.args
            .iter()
            .filter(|arg| scenario.is_some() || arg.as_str() != "{scenario}")
            .map(|arg| {
                arg.replace("{scenario}", scenario.unwrap_or_default())
                    .replace("{output_dir}", &output_dir)
                    .replace("{worker}", &worker)
            })
            .collect()
    }

    /// Command for a single scenario on a worker
    pub fn for_scenario(&self, scenario: &ScenarioRef, output_dir: &Path, worker_id: usize) -> CommandSpec {
        CommandSpec::new(&self.program).args(self.render_args(
            Some(&scenario.location()),
            output_dir,
            Some(worker_id),
        ))
    }

    /// Command for the whole corpus, optionally filtered by tags
    pub fn for_corpus(&self, output_dir: &Path, tags: Option<&str>) -> CommandSpec {
        let spec = CommandSpec::new(&self.program).args(self.render_args(None, output_dir, None));
        with_tags(spec, tags)
    }

    /// Command without output placeholders, e.g. a dry run
    pub fn plain(&self, tags: Option<&str>) -> CommandSpec {
        let spec = CommandSpec::new(&self.program).args(self.render_args(None, Path::new(""), None));
        with_tags(spec, tags)
    }
}

fn with_tags(spec: CommandSpec, tags: Option<&str>) -> CommandSpec {
    match tags.filter(|t| !t.trim().is_empty()) {
        Some(tags) => spec.arg("--tags").arg(tags),
        None => spec,
    }
}

/// Which variables reach scenario processes, on top of the inherited environment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvForwarding {
    /// Names copied from the controller's environment when present
    #[serde(default = "default_forwarded")]
    pub forward: Vec<String>,
    /// Values always set, winning over forwarded ones
    #[serde(default)]
    pub set: BTreeMap<String, String>,
}

fn default_forwarded() -> Vec<String> {
    DEFAULT_FORWARDED_VARS.iter().map(|s| s.to_string()).collect()
}

impl Default for EnvForwarding {
    fn default() -> Self {
        Self {
            forward: default_forwarded(),
            set: BTreeMap::new(),
        }
    }
}

impl EnvForwarding {
    /// Resolve against the current process environment
    pub fn resolve(&self, worker_id: Option<usize>, tags: Option<&str>) -> BTreeMap<String, String> {
        self.resolve_with(|key| std::env::var(key).ok(), worker_id, tags)
    }

    /// Resolve against an arbitrary lookup
    pub fn resolve_with<F>(
        &self,
        lookup: F,
        worker_id: Option<usize>,
        tags: Option<&str>,
    ) -> BTreeMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut vars: BTreeMap<String, String> = self
            .forward
            .iter()
            .filter_map(|key| lookup(key).map(|value| (key.clone(), value)))
            .collect();

        if vars.contains_key(REMOTE_URL_VAR) && !vars.contains_key(REMOTE_FLAG_VAR) {
            vars.insert(REMOTE_FLAG_VAR.to_string(), "true".to_string());
        }

        vars.extend(self.set.clone());

        if let Some(worker_id) = worker_id {
            vars.insert(WORKER_ID_VAR.to_string(), worker_id.to_string());
        }
        if let Some(tags) = tags {
            vars.insert(TAGS_VAR.to_string(), tags.to_string());
        }
        vars
    }
}
