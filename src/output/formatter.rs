//! Output formatters for run results
//!
//! Provides JSON, Table, CSV and summary output formats.

use anyhow::Context;
use serde::Serialize;
use std::path::Path;

use crate::controller::RunOutcome;
use crate::models::{ExecutionResult, ExecutionStatus, RunCounters, RunSummary, ScenarioRef};
use crate::results::Reconciliation;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

const CSV_HEADER: [&str; 6] = [
    "scenario",
    "worker",
    "status",
    "exit_code",
    "duration_ms",
    "message",
];

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "csv" => Some(OutputFormat::Csv),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct OutcomeJson<'a> {
    success: bool,
    counters: RunCounters,
    summary: Option<&'a RunSummary>,
    reconciliation: Option<&'a Reconciliation>,
    error: Option<String>,
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    fn paint(&self, text: &str, status: ExecutionStatus) -> String {
        if !self.colorize {
            return text.to_string();
        }
        let code = match status {
            ExecutionStatus::Success => "32",
            ExecutionStatus::Failure => "31",
            ExecutionStatus::Timeout | ExecutionStatus::Cancelled => "33",
        };
        format!("\x1b[{code}m{text}\x1b[0m")
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        let encoded = if self.format == OutputFormat::JsonPretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        encoded.unwrap_or_default()
    }

    fn format_result_table(&self, result: &ExecutionResult) -> String {
        let status = format!("{} {:9}", result.status.symbol(), result.status.to_string());
        let mut line = format!(
            "{} w{:<2} {:48} [{:>7}ms]",
            self.paint(&status, result.status),
            result.worker_id,
            result.scenario,
            result.duration_ms
        );
        if let Some(message) = &result.message {
            line.push_str(&format!(" {message}"));
        }
        line
    }

    /// Format the execution results of a run
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Table => self.format_summary_table(summary),
            OutputFormat::Json | OutputFormat::JsonPretty => self.to_json(summary),
            OutputFormat::Csv => results_csv(&summary.results).unwrap_or_default(),
            OutputFormat::Summary => self.format_summary_brief(summary),
        }
    }

    fn format_summary_table(&self, summary: &RunSummary) -> String {
        let mut output = String::new();

        output.push_str(&format!("\n{RULE}\n Scenario Results\n{RULE}\n"));
        for result in &summary.results {
            output.push_str(&format!(" {}\n", self.format_result_table(result)));
        }
        output.push_str(&format!("{RULE}\n"));
        output.push_str(&format!(
            " Total: {} | Pass: {} | Fail: {} | Timeout: {} | Cancelled: {}\n",
            summary.total, summary.passed, summary.failed, summary.timed_out, summary.cancelled
        ));
        output.push_str(&format!(
            " Pass Rate: {:5.1}% | Duration: {}ms\n",
            summary.pass_rate(),
            summary.total_duration_ms
        ));

        let timed_out: Vec<_> = summary
            .results
            .iter()
            .filter(|r| r.status == ExecutionStatus::Timeout)
            .collect();
        if !timed_out.is_empty() {
            output.push_str(&format!("\n Timed out ({}):\n", timed_out.len()));
            for result in timed_out {
                output.push_str(&format!("   - {}\n", result.scenario));
            }
        }

        let failed: Vec<_> = summary
            .results
            .iter()
            .filter(|r| r.status == ExecutionStatus::Failure)
            .collect();
        if !failed.is_empty() {
            output.push_str(&format!("\n Failed ({}):\n", failed.len()));
            for result in failed {
                output.push_str(&format!("   - {} (exit {})\n", result.scenario, result.exit_code));
            }
        }

        output
    }

    fn format_summary_brief(&self, summary: &RunSummary) -> String {
        format!(
            "{}/{} scenario(s) passed ({:.1}%) in {}ms",
            summary.passed,
            summary.total,
            summary.pass_rate(),
            summary.total_duration_ms
        )
    }

    /// Format reconciled counters
    pub fn format_reconciliation(&self, reconciliation: &Reconciliation) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.to_json(reconciliation),
            OutputFormat::Csv => format!(
                "passed,failed,total,source,skipped\n{},{},{},{},{}\n",
                reconciliation.counters.passed(),
                reconciliation.counters.failed(),
                reconciliation.counters.total(),
                reconciliation.source,
                reconciliation.skipped
            ),
            OutputFormat::Summary => reconciliation.counters.to_string(),
            OutputFormat::Table => {
                let mut output = format!(" {}\n", reconciliation);
                if let Some(declared) = reconciliation.declared_total {
                    if declared != reconciliation.counters.total() {
                        output.push_str(&format!(
                            " Declared total {} ignored (passed + failed = {})\n",
                            declared,
                            reconciliation.counters.total()
                        ));
                    }
                }
                if reconciliation.files_scanned > 0 {
                    output.push_str(&format!(
                        " Artifacts: {} scanned, {} rejected\n",
                        reconciliation.files_scanned, reconciliation.files_rejected
                    ));
                }
                output
            }
        }
    }

    /// Format the final outcome of a controller run
    pub fn format_outcome(&self, outcome: &RunOutcome) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.to_json(&OutcomeJson {
                success: outcome.is_success(),
                counters: outcome.counters,
                summary: outcome.summary.as_ref(),
                reconciliation: outcome.reconciliation.as_ref(),
                error: outcome.error.as_ref().map(|e| e.to_string()),
            }),
            OutputFormat::Csv => outcome
                .summary
                .as_ref()
                .map(|s| results_csv(&s.results).unwrap_or_default())
                .unwrap_or_default(),
            OutputFormat::Table | OutputFormat::Summary => {
                let mut output = String::new();
                if let Some(summary) = &outcome.summary {
                    output.push_str(&self.format_summary(summary));
                    output.push('\n');
                }
                match &outcome.reconciliation {
                    Some(reconciliation) if self.format == OutputFormat::Table => {
                        output.push_str(&self.format_reconciliation(reconciliation));
                    }
                    _ => output.push_str(&format!("{}\n", outcome.counters)),
                }
                if let Some(error) = &outcome.error {
                    output.push_str(&format!("Error: {error}\n"));
                }
                output
            }
        }
    }

    /// Format a discovered scenario list
    pub fn format_scenarios(&self, scenarios: &[ScenarioRef]) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => {
                let locations: Vec<String> = scenarios.iter().map(|s| s.location()).collect();
                self.to_json(&locations)
            }
            OutputFormat::Summary => format!("{} scenario(s)", scenarios.len()),
            OutputFormat::Table | OutputFormat::Csv => {
                let mut output: String = scenarios
                    .iter()
                    .map(|s| format!("{}\n", s.location()))
                    .collect();
                if self.format == OutputFormat::Table {
                    output.push_str(&format!("\n{} scenario(s)\n", scenarios.len()));
                }
                output
            }
        }
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn write_result_rows<W: std::io::Write>(
    writer: &mut csv::Writer<W>,
    results: &[ExecutionResult],
) -> csv::Result<()> {
    writer.write_record(CSV_HEADER)?;
    for result in results {
        writer.write_record([
            result.scenario.clone(),
            result.worker_id.to_string(),
            result.status.to_string(),
            result.exit_code.to_string(),
            result.duration_ms.to_string(),
            result.message.clone().unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn results_csv(results: &[ExecutionResult]) -> anyhow::Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    write_result_rows(&mut writer, results)?;
    let bytes = writer.into_inner().context("Failed to flush CSV")?;
    Ok(String::from_utf8(bytes)?)
}

/// Export execution results as CSV
pub fn export_csv(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    write_result_rows(&mut writer, &summary.results)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
