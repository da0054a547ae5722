//! Scenario Runner - parallel execution engine for BDD scenario corpora
//!
//! Discovers scenarios, fans them out over a pool of worker processes with
//! per-worker result partitions, supervises every process with timeouts and
//! graceful termination, and reconciles pass/fail counters from the result
//! artifacts the runner leaves behind.
//!
//! ## Usage
//!
//! ```bash
//! # Run the corpus on three workers
//! scenario-runner run --workers 3
//!
//! # Run smoke scenarios sequentially and export results
//! scenario-runner run --tags @smoke --workers 1 --export run.csv
//!
//! # List scenarios without running them
//! scenario-runner list --tags @smoke
//!
//! # Count an existing results directory
//! scenario-runner reconcile reports/allure-results
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

mod cli;
mod config;
mod controller;
mod discovery;
mod error;
mod executor;
mod models;
mod output;
mod results;
mod utils;

use cli::Args;
use config::{print_env_help, AppConfig, ConfigFile, EnvConfig};
use controller::{RunController, RunRequest};
use discovery::{Discoverer, DiscoveryMode};
use executor::{shutdown_signal, ProcessRegistry, Supervisor, SIGNAL_EXIT_CODE};
use output::{export_csv, OutputFormat, ResultFormatter};
use results::{artifacts, Reconciler};
use utils::logger::{init_logger, LogLevel};
use utils::timer::Timer;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env = EnvConfig::load();

    let verbose = args.verbose || env.verbose.unwrap_or(false);
    init_logger(LogLevel::resolve(verbose, env.log_level.as_deref()));
    if env.has_any() {
        debug!("Environment overrides: {:?}", env);
    }

    let command = match args.command {
        cli::Command::Config(config_args) => {
            return manage_config(config_args, args.config.as_deref(), &env);
        }
        command => command,
    };

    let (app, config_path) = ConfigFile::resolve(args.config.as_deref(), &env)?;
    if let Some(path) = &config_path {
        info!("Using configuration {}", path.display());
    }

    let registry = Arc::new(ProcessRegistry::new());
    // A run stops through its controller; other commands rely on the hook
    if !matches!(command, cli::Command::Run(_)) {
        registry.install_exit_hook(app.grace());
    }

    let code = match command {
        cli::Command::Run(run_args) => run_scenarios(run_args, app, registry).await?,
        cli::Command::List(list_args) => list_scenarios(list_args, &app, registry).await?,
        cli::Command::Reconcile(reconcile_args) => reconcile_results(reconcile_args, &app)?,
        cli::Command::Results(results_args) => manage_results(results_args, &app)?,
        cli::Command::Config(_) => 0,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn parse_format(format: &str) -> Result<OutputFormat> {
    OutputFormat::from_str(format).ok_or_else(|| anyhow::anyhow!("Unknown output format: {format}"))
}

fn formatter_for(format: OutputFormat) -> ResultFormatter {
    let formatter = ResultFormatter::new(format);
    if std::io::stdout().is_terminal() {
        formatter
    } else {
        formatter.no_color()
    }
}

/// Lines of the output window shown when a quiet run fails
const FAILURE_TAIL: usize = 20;

async fn run_scenarios(
    args: cli::RunArgs,
    mut app: AppConfig,
    registry: Arc<ProcessRegistry>,
) -> Result<i32> {
    if let Some(workers) = args.workers {
        app.workers = workers;
    }
    if let Some(timeout) = args.timeout {
        app.timeout_secs = timeout;
    }
    if let Some(corpus) = args.corpus {
        app.corpus_dir = corpus;
    }
    if let Some(dir) = args.results_dir {
        app.results_dir = dir;
    }
    if let Some(format) = args.format {
        app.format = format;
    }
    if args.tags.is_some() {
        app.tags = args.tags;
    }
    app.validate().context("Invalid run options")?;

    let format = parse_format(&app.format)?;
    let formatter = formatter_for(format);
    let stream_to_stdout = matches!(format, OutputFormat::Table | OutputFormat::Summary);

    let request = RunRequest::new(app.workers).with_tags(app.tags.clone());
    info!(
        "Running {} in {} ({} mode, results in {})",
        app.tags.as_deref().unwrap_or("all scenarios"),
        app.corpus_dir.display(),
        request.mode(),
        app.results_dir.display()
    );

    let timer = Timer::start("run");
    let mut controller = RunController::new(app.run_settings(), Arc::clone(&registry));
    let run_id = controller.start(request)?;
    info!("Run {} started", run_id);

    let quiet = args.quiet;
    let shutdown = async {
        let signal = shutdown_signal().await;
        warn!("Received {}, stopping run {}", signal, run_id);
        for info in registry.snapshot() {
            debug!("Stopping {}", info);
        }
    };
    let finished = controller
        .run_until(
            |line| {
                if quiet {
                    return;
                }
                if stream_to_stdout {
                    println!("{line}");
                } else {
                    eprintln!("{line}");
                }
            },
            shutdown,
        )
        .await?;

    let Some(outcome) = finished else {
        info!(
            "Run {} stopped after {:.1}s: {}",
            run_id,
            timer.stop().as_secs_f64(),
            controller.status()
        );
        return Ok(SIGNAL_EXIT_CODE);
    };
    let elapsed = timer.stop();
    debug!("Controller after run: {}", controller.status());

    if quiet && !outcome.is_success() && !controller.output().is_empty() {
        let window = controller.output().to_vec();
        eprintln!("Last output:");
        for line in &window[window.len().saturating_sub(FAILURE_TAIL)..] {
            eprintln!("  {line}");
        }
    }

    println!("{}", formatter.format_outcome(&outcome));

    if let (Some(path), Some(summary)) = (&args.export, &outcome.summary) {
        export_csv(path, summary)?;
        info!("Exported {} result(s) to {}", summary.total, path.display());
    }

    if let Some(e) = controller.last_error() {
        error!("Run {} failed: {}", run_id, e);
    }
    info!(
        "Run {} finished in {:.1}s: {}",
        run_id,
        elapsed.as_secs_f64(),
        controller.counters()
    );

    Ok(if outcome.is_success() { 0 } else { 1 })
}

async fn list_scenarios(
    args: cli::ListArgs,
    app: &AppConfig,
    registry: Arc<ProcessRegistry>,
) -> Result<i32> {
    let mode = match args.mode.as_deref() {
        Some(mode) => DiscoveryMode::from_str(mode)
            .ok_or_else(|| anyhow::anyhow!("Unknown discovery mode: {mode}"))?,
        None => app.discovery.mode,
    };
    let corpus = args.corpus.unwrap_or_else(|| app.corpus_dir.clone());
    let tags = args.tags.or_else(|| app.tags.clone());

    let supervisor = Supervisor::new(registry).with_grace(app.grace());
    let scenarios = Discoverer::new(supervisor, corpus)
        .with_mode(mode)
        .with_command(app.discovery.command.clone())
        .with_timeout(Duration::from_secs(app.discovery.timeout_secs))
        .discover(tags.as_deref())
        .await;

    let formatter = formatter_for(parse_format(&app.format)?);
    println!("{}", formatter.format_scenarios(&scenarios));

    if scenarios.is_empty() {
        warn!("No scenarios discovered");
        return Ok(1);
    }
    Ok(0)
}

/// Exit 0 for any readable results directory, even one with nothing to count
fn reconcile_results(args: cli::ReconcileArgs, app: &AppConfig) -> Result<i32> {
    let dir = artifacts::absolutize(&args.dir.unwrap_or_else(|| app.results_dir.clone()));
    if !dir.is_dir() {
        anyhow::bail!("Results directory not found: {}", dir.display());
    }
    let formatter = formatter_for(parse_format(&args.format)?);

    let reconciliation = Reconciler::new()
        .with_summary_file(&app.summary_file)
        .reconcile(&dir);
    println!("{}", formatter.format_reconciliation(&reconciliation));

    if reconciliation.counters.is_zero() {
        warn!("Nothing to count in {}", dir.display());
    }
    Ok(0)
}

fn manage_results(args: cli::ResultsArgs, app: &AppConfig) -> Result<i32> {
    match args.action {
        cli::ResultsAction::Merge { dest, root } => {
            let root = root.unwrap_or_else(|| app.results_dir.clone());
            let report = artifacts::merge_into(&root, &dest)
                .with_context(|| format!("Failed to merge {} into {}", root.display(), dest.display()))?;
            println!(
                "✓ Merged {} artifact(s) from {} partition(s) into {} ({} renamed)",
                report.copied,
                report.partitions,
                dest.display(),
                report.renamed
            );
        }
        cli::ResultsAction::Prune { root } => {
            let root = root.unwrap_or_else(|| app.results_dir.clone());
            let removed = artifacts::prune_empty(&root)
                .with_context(|| format!("Failed to prune {}", root.display()))?;
            println!("✓ Removed {} empty artifact(s) from {}", removed, root.display());
        }
    }
    Ok(0)
}

fn manage_config(args: cli::ConfigArgs, explicit: Option<&Path>, env: &EnvConfig) -> Result<()> {
    match args.action {
        cli::ConfigAction::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {}. Use --force to overwrite.",
                    path.display()
                );
            }

            ConfigFile::example().save(&path)?;
            println!("✓ Configuration file created: {}", path.display());
            println!("\nEdit the file to customize your settings.");
        }

        cli::ConfigAction::Show => {
            let (app, path) = ConfigFile::resolve(explicit, env)?;
            match path {
                Some(path) => println!("# {}", path.display()),
                None => println!("# built-in defaults"),
            }
            println!("{}", serde_yaml::to_string(&app)?);
        }

        cli::ConfigAction::Validate { path } => {
            let Some(path) = path
                .or_else(|| explicit.map(Path::to_path_buf))
                .or_else(ConfigFile::find)
            else {
                anyhow::bail!("No configuration file found");
            };

            match ConfigFile::load(&path) {
                Ok(_) => println!("✓ Configuration file is valid: {}", path.display()),
                Err(e) => {
                    println!("✗ Configuration file is invalid: {}", path.display());
                    println!("  Error: {e:#}");
                    return Err(e);
                }
            }
        }

        cli::ConfigAction::Env => {
            print_env_help();
            println!();
            env.print_summary();
        }
    }

    Ok(())
}
