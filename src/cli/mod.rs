//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parallel scenario runner for BDD corpora
#[derive(Parser, Debug)]
#[command(name = "scenario-runner")]
#[command(version)]
#[command(about = "Discover, run and reconcile BDD scenarios across worker processes")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run scenarios and print the reconciled outcome
    Run(RunArgs),

    /// Discover and print scenarios without running them
    List(ListArgs),

    /// Count results already present in a results directory
    Reconcile(ReconcileArgs),

    /// Maintain result artifacts
    Results(ResultsArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Tag expression handed to the runner
    #[arg(short, long)]
    pub tags: Option<String>,

    /// Number of workers (1 runs the corpus sequentially)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Per-scenario timeout in seconds (0 disables)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Directory containing the features
    #[arg(long)]
    pub corpus: Option<PathBuf>,

    /// Results root directory
    #[arg(short, long)]
    pub results_dir: Option<PathBuf>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long)]
    pub format: Option<String>,

    /// Export scenario results as CSV
    #[arg(short, long)]
    pub export: Option<PathBuf>,

    /// Do not stream runner output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Arguments for list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Tag expression handed to the runner
    #[arg(short, long)]
    pub tags: Option<String>,

    /// Directory containing the features
    #[arg(long)]
    pub corpus: Option<PathBuf>,

    /// Discovery mode (dry-run, feature-scan)
    #[arg(short, long)]
    pub mode: Option<String>,
}

/// Arguments for reconcile command
#[derive(Parser, Debug)]
pub struct ReconcileArgs {
    /// Results directory (defaults to the configured root)
    pub dir: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: String,
}

/// Arguments for results command
#[derive(Parser, Debug)]
pub struct ResultsArgs {
    #[command(subcommand)]
    pub action: ResultsAction,
}

#[derive(Subcommand, Debug)]
pub enum ResultsAction {
    /// Copy every worker partition into one directory
    Merge {
        /// Destination directory
        dest: PathBuf,

        /// Results root (defaults to the configured root)
        #[arg(short, long)]
        root: Option<PathBuf>,
    },

    /// Remove zero-byte artifacts
    Prune {
        /// Results root (defaults to the configured root)
        #[arg(short, long)]
        root: Option<PathBuf>,
    },
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write an example configuration file
    Init {
        /// Destination path
        #[arg(default_value = "scenario-runner.yaml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,

    /// Validate a configuration file
    Validate {
        /// File to validate (defaults to the discovered file)
        path: Option<PathBuf>,
    },

    /// Describe environment variables and their current values
    Env,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args() {
        let args = Args::parse_from([
            "scenario-runner",
            "run",
            "--tags",
            "@smoke",
            "--workers",
            "4",
            "--export",
            "out.csv",
        ]);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.tags.as_deref(), Some("@smoke"));
                assert_eq!(run.workers, Some(4));
                assert_eq!(run.export, Some(PathBuf::from("out.csv")));
                assert!(run.timeout.is_none());
                assert!(!run.quiet);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let args = Args::parse_from(["scenario-runner", "list", "-v", "--config", "x.yaml"]);
        assert!(args.verbose);
        assert_eq!(args.config, Some(PathBuf::from("x.yaml")));
        assert!(matches!(args.command, Command::List(_)));
    }

    #[test]
    fn test_results_merge() {
        let args = Args::parse_from(["scenario-runner", "results", "merge", "merged", "--root", "r"]);
        match args.command {
            Command::Results(ResultsArgs {
                action: ResultsAction::Merge { dest, root },
            }) => {
                assert_eq!(dest, PathBuf::from("merged"));
                assert_eq!(root, Some(PathBuf::from("r")));
            }
            _ => panic!("Expected Results Merge command"),
        }
    }

    #[test]
    fn test_config_init_default_path() {
        let args = Args::parse_from(["scenario-runner", "config", "init"]);
        match args.command {
            Command::Config(ConfigArgs {
                action: ConfigAction::Init { path, force },
            }) => {
                assert_eq!(path, PathBuf::from("scenario-runner.yaml"));
                assert!(!force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
