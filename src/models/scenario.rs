//! Scenario references
//!
//! A `ScenarioRef` identifies one runnable scenario by source location.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// One independently executable scenario
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScenarioRef {
    /// Feature file, relative to the corpus root
    pub path: PathBuf,
    /// Line of the `Scenario:` keyword, when known
    pub line: Option<u32>,
    /// Tag expression that was active when the scenario was discovered
    pub tags: Option<String>,
}

impl ScenarioRef {
    /// Reference a whole feature file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            line: None,
            tags: None,
        }
    }

    /// Reference a single scenario by line number
    pub fn at_line(path: impl Into<PathBuf>, line: u32) -> Self {
        Self {
            path: path.into(),
            line: Some(line),
            tags: None,
        }
    }

    pub fn with_tags(mut self, tags: Option<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn feature(&self) -> &Path {
        &self.path
    }

    /// Location in the `path:line` form the runner understands
    pub fn location(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{}", self.path.display(), line),
            None => self.path.display().to_string(),
        }
    }
}

impl fmt::Display for ScenarioRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location())
    }
}
