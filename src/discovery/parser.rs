//! Scenario listing parsers
//!
//! Text adapters that turn runner dry-run output or raw feature files into
//! scenario references.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::warn;

use crate::models::ScenarioRef;

/// `# <path>:<line>` trailer printed after every dry-run header
static LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\s+(\S+?):(\d+)").expect("valid regex"));

/// Scenario keyword at the start of a feature file line
static SCENARIO_KEYWORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*Scenario(?: Outline)?:").expect("valid regex"));

fn is_scenario_header(line: &str) -> bool {
    line.contains("Scenario:") || line.contains("Scenario Outline:")
}

/// Extract scenario locations from dry-run output, stdout and stderr mixed.
///
/// Order of first appearance is kept; repeats are dropped.
pub fn parse_dry_run(output: &str) -> Vec<ScenarioRef> {
    let mut seen = HashSet::new();
    let mut scenarios = Vec::new();
    let mut current_feature: Option<PathBuf> = None;

    for line in output.lines() {
        if line.contains("Feature:") {
            current_feature = LOCATION_RE
                .captures(line)
                .map(|caps| PathBuf::from(&caps[1]));
            continue;
        }
        if !is_scenario_header(line) {
            continue;
        }

        let Some(caps) = LOCATION_RE.captures(line) else {
            warn!(
                "No location on scenario line in {}: {}",
                current_feature
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<unknown feature>".to_string()),
                line.trim()
            );
            continue;
        };
        let Ok(number) = caps[2].parse::<u32>() else {
            warn!("Line number out of range: {}", line.trim());
            continue;
        };

        let scenario = ScenarioRef::at_line(&caps[1], number);
        if seen.insert(scenario.location()) {
            scenarios.push(scenario);
        }
    }

    scenarios
}

/// Scenarios declared in one feature file, located by keyword
pub fn scan_feature(relative_path: &Path, content: &str) -> Vec<ScenarioRef> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| SCENARIO_KEYWORD_RE.is_match(line))
        .map(|(index, _)| ScenarioRef::at_line(relative_path, index as u32 + 1))
        .collect()
}
