//! Run controller
//!
//! Owns the lifecycle of one test run at a time: start, streamed output,
//! stop with full process cleanup, and the final reconciliation that
//! publishes pass/fail counters.

#![allow(dead_code)]

pub mod output;

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::discovery::{Discoverer, DiscoveryMode, DEFAULT_DISCOVERY_TIMEOUT};
use crate::error::{Error, Result};
use crate::executor::{
    CommandSpec, CommandTemplate, EnvForwarding, ExecOptions, ProcessRegistry, Supervisor,
    WorkerPool, DEFAULT_GRACE, DEFAULT_SCENARIO_TIMEOUT,
};
use crate::models::{ExecutionResult, RunCounters, RunSummary};
use crate::results::{artifacts, Reconciler, Reconciliation, DEFAULT_SUMMARY_FILE};
use self::output::{
    OutputReceiver, OutputSender, OutputWindow, DEFAULT_BATCH_SIZE, DEFAULT_WINDOW_CAPACITY,
};

/// Interval between polls in [`RunController::run_to_completion`]
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a stopped run task gets to exit on its own
const STOP_POLL: Duration = Duration::from_millis(100);

/// Extra time on top of the grace window before the run task is aborted
const STOP_DEADLINE_SLACK: Duration = Duration::from_secs(10);

/// Controller lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Stopping,
    Completing,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Running => write!(f, "running"),
            RunState::Stopping => write!(f, "stopping"),
            RunState::Completing => write!(f, "completing"),
        }
    }
}

/// How a run executes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Discovered scenarios over a worker pool
    Parallel,
    /// One streaming invocation over the whole corpus
    Sequential,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Parallel => write!(f, "parallel"),
            RunMode::Sequential => write!(f, "sequential"),
        }
    }
}

/// Parameters of one start request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunRequest {
    pub tags: Option<String>,
    pub workers: usize,
}

impl RunRequest {
    pub fn new(workers: usize) -> Self {
        Self {
            tags: None,
            workers: workers.max(1),
        }
    }

    pub fn with_tags(mut self, tags: Option<String>) -> Self {
        self.tags = tags.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn mode(&self) -> RunMode {
        if self.workers > 1 {
            RunMode::Parallel
        } else {
            RunMode::Sequential
        }
    }
}

/// Everything the controller needs to launch runs
#[derive(Clone, Debug)]
pub struct RunSettings {
    pub corpus_dir: PathBuf,
    pub results_root: PathBuf,
    pub discovery: DiscoveryMode,
    pub discovery_command: CommandTemplate,
    pub discovery_timeout: Duration,
    pub scenario_command: CommandTemplate,
    pub corpus_command: CommandTemplate,
    pub env: EnvForwarding,
    pub scenario_timeout: Option<Duration>,
    pub grace: Duration,
    pub summary_file: PathBuf,
    pub batch_size: usize,
    pub window_capacity: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            corpus_dir: PathBuf::from("."),
            results_root: PathBuf::from("reports/allure-results"),
            discovery: DiscoveryMode::DryRun,
            discovery_command: CommandTemplate::behave_dry_run(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            scenario_command: CommandTemplate::behave_scenario(),
            corpus_command: CommandTemplate::behave_corpus(),
            env: EnvForwarding::default(),
            scenario_timeout: Some(DEFAULT_SCENARIO_TIMEOUT),
            grace: DEFAULT_GRACE,
            summary_file: PathBuf::from(DEFAULT_SUMMARY_FILE),
            batch_size: DEFAULT_BATCH_SIZE,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
        }
    }
}

/// Point-in-time view of the controller
#[derive(Clone, Debug, Serialize)]
pub struct RunStatus {
    pub state: RunState,
    pub mode: Option<RunMode>,
    pub run_id: Option<String>,
    pub counters: RunCounters,
    pub last_error: Option<String>,
    pub live_processes: usize,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.state)?;
        if let (Some(run_id), Some(mode)) = (&self.run_id, self.mode) {
            write!(f, " run {run_id} ({mode})")?;
        }
        write!(f, " {} | live processes: {}", self.counters, self.live_processes)?;
        if let Some(err) = &self.last_error {
            write!(f, " | last error: {err}")?;
        }
        Ok(())
    }
}

/// Final outcome of a run, delivered once by the poll that completes it
#[derive(Debug)]
pub struct RunOutcome {
    pub counters: RunCounters,
    pub summary: Option<RunSummary>,
    pub reconciliation: Option<Reconciliation>,
    pub error: Option<Error>,
}

impl RunOutcome {
    /// At least one scenario ran and every execution succeeded
    pub fn is_success(&self) -> bool {
        self.error.is_none()
            && self
                .summary
                .as_ref()
                .map(|s| s.is_all_passed())
                .unwrap_or(false)
    }
}

/// Result of one [`RunController::poll`]
#[derive(Debug)]
pub struct PollUpdate {
    pub lines: Vec<String>,
    pub state: RunState,
    pub outcome: Option<RunOutcome>,
}

struct ActiveRun {
    task: JoinHandle<Result<Vec<ExecutionResult>>>,
    output: OutputReceiver,
    cancel: Arc<AtomicBool>,
}

/// The run controller
pub struct RunController {
    settings: RunSettings,
    registry: Arc<ProcessRegistry>,
    supervisor: Supervisor,
    state: RunState,
    mode: Option<RunMode>,
    run_id: Option<String>,
    counters: RunCounters,
    last_error: Option<String>,
    window: OutputWindow,
    active: Option<ActiveRun>,
}

impl RunController {
    pub fn new(settings: RunSettings, registry: Arc<ProcessRegistry>) -> Self {
        let supervisor = Supervisor::new(Arc::clone(&registry)).with_grace(settings.grace);
        let window = OutputWindow::new(settings.window_capacity);
        Self {
            settings,
            registry,
            supervisor,
            state: RunState::Idle,
            mode: None,
            run_id: None,
            counters: RunCounters::zero(),
            last_error: None,
            window,
            active: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != RunState::Idle
    }

    pub fn counters(&self) -> RunCounters {
        self.counters
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Most recent output lines
    pub fn output(&self) -> &OutputWindow {
        &self.window
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            state: self.state,
            mode: self.mode,
            run_id: self.run_id.clone(),
            counters: self.counters,
            last_error: self.last_error.clone(),
            live_processes: self.registry.len(),
        }
    }

    /// Launch a run in the background, returning its id
    pub fn start(&mut self, request: RunRequest) -> Result<String> {
        if self.state != RunState::Idle {
            return Err(Error::AlreadyRunning);
        }

        self.counters = RunCounters::zero();
        self.window.clear();
        self.last_error = None;

        let mode = request.mode();
        let pool = self.worker_pool(request.workers);
        let prepared = match mode {
            RunMode::Parallel => pool.prepare(),
            RunMode::Sequential => artifacts::purge(pool.results_root()).map_err(|e| {
                Error::infrastructure(format!(
                    "cannot purge {}: {}",
                    pool.results_root().display(),
                    e
                ))
            }),
        };
        if let Err(e) = prepared {
            error!("Cannot start run: {}", e);
            self.last_error = Some(e.to_string());
            return Err(e);
        }

        let run_id = generate_run_id();
        let (sink, receiver) = output::channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let task = match mode {
            RunMode::Parallel => {
                let discoverer = Discoverer::new(self.supervisor.clone(), &self.settings.corpus_dir)
                    .with_mode(self.settings.discovery)
                    .with_command(self.settings.discovery_command.clone())
                    .with_timeout(self.settings.discovery_timeout);
                tokio::spawn(run_parallel(
                    discoverer,
                    pool,
                    request.tags.clone(),
                    Arc::clone(&cancel),
                    sink,
                ))
            }
            RunMode::Sequential => {
                let spec = self
                    .settings
                    .corpus_command
                    .for_corpus(pool.results_root(), request.tags.as_deref())
                    .envs(self.settings.env.resolve(None, request.tags.as_deref()))
                    .current_dir(&self.settings.corpus_dir);
                tokio::spawn(run_sequential(self.supervisor.clone(), spec, sink))
            }
        };

        info!(
            "Started run {} ({}, {} worker(s), tags: {})",
            run_id,
            mode,
            request.workers,
            request.tags.as_deref().unwrap_or("-")
        );

        self.state = RunState::Running;
        self.mode = Some(mode);
        self.run_id = Some(run_id.clone());
        self.active = Some(ActiveRun {
            task,
            output: receiver,
            cancel,
        });
        Ok(run_id)
    }

    /// Drain buffered output without waiting.
    ///
    /// The sentinel moves the run to `Completing`; the outcome is produced by
    /// the first poll that finds the run task finished.
    pub async fn poll(&mut self) -> PollUpdate {
        let Some(mut active) = self.active.take() else {
            return PollUpdate {
                lines: Vec::new(),
                state: self.state,
                outcome: None,
            };
        };

        let batch = active.output.drain(self.settings.batch_size);
        let mut lines = batch.lines;
        self.window.extend(lines.iter().cloned());

        if active.output.is_completed() {
            if self.state == RunState::Running {
                debug!("Output complete, waiting for the run task");
            }
            self.state = RunState::Completing;
        }

        // A child can close its pipes and keep running; never await it here
        if !active.task.is_finished() {
            self.active = Some(active);
            return PollUpdate {
                lines,
                state: self.state,
                outcome: None,
            };
        }

        self.state = RunState::Completing;
        let rest = active.output.drain_all(self.settings.batch_size);
        self.window.extend(rest.lines.iter().cloned());
        lines.extend(rest.lines);
        if !active.output.is_completed() && active.output.is_disconnected() {
            debug!("Run task ended without an output sentinel");
        }

        let outcome = self.complete(active.task).await;
        PollUpdate {
            lines,
            state: self.state,
            outcome: Some(outcome),
        }
    }

    /// Reconcile a finished run task
    async fn complete(&mut self, task: JoinHandle<Result<Vec<ExecutionResult>>>) -> RunOutcome {
        let joined = match task.await {
            Ok(result) => result,
            Err(e) => Err(Error::infrastructure(format!("run task failed: {e}"))),
        };

        let outcome = match joined {
            Ok(results) => {
                let reconciliation = Reconciler::new()
                    .with_summary_file(&self.settings.summary_file)
                    .reconcile(&artifacts::absolutize(&self.settings.results_root));
                self.counters = reconciliation.counters;
                info!("Run finished: {}", reconciliation);
                RunOutcome {
                    counters: self.counters,
                    summary: Some(RunSummary::new(results)),
                    reconciliation: Some(reconciliation),
                    error: None,
                }
            }
            Err(e) => {
                warn!("Run ended without results: {}", e);
                self.last_error = Some(e.to_string());
                RunOutcome {
                    counters: self.counters,
                    summary: None,
                    reconciliation: None,
                    error: Some(e),
                }
            }
        };

        self.state = RunState::Idle;
        outcome
    }

    /// Poll until the run is over, handing every output line to `on_line`
    pub async fn run_to_completion<F>(&mut self, mut on_line: F) -> Result<RunOutcome>
    where
        F: FnMut(&str),
    {
        if self.active.is_none() {
            return Err(Error::NotRunning);
        }
        loop {
            let update = self.poll().await;
            for line in &update.lines {
                on_line(line);
            }
            if let Some(outcome) = update.outcome {
                return Ok(outcome);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Like [`Self::run_to_completion`], but stops the run as soon as
    /// `shutdown` resolves. A stopped run yields `None`.
    pub async fn run_until<F, S>(&mut self, on_line: F, shutdown: S) -> Result<Option<RunOutcome>>
    where
        F: FnMut(&str),
        S: Future<Output = ()>,
    {
        let finished = tokio::select! {
            outcome = self.run_to_completion(on_line) => Some(outcome),
            _ = shutdown => None,
        };

        match finished {
            Some(outcome) => outcome.map(Some),
            None => match self.stop().await {
                Ok(()) | Err(Error::NotRunning) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    /// Cancel the run and terminate every live process.
    ///
    /// Output still queued is discarded and no reconciliation happens, so
    /// counters stay at zero.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Err(Error::NotRunning);
        };

        self.state = RunState::Stopping;
        info!("Stopping run {}", self.run_id.as_deref().unwrap_or("-"));
        active.cancel.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + self.settings.grace + STOP_DEADLINE_SLACK;
        let mut task = active.task;
        loop {
            let report = self.registry.terminate_all(self.settings.grace).await;
            if !report.is_clean() {
                warn!("Force-removed {} registry entr(ies) during stop", report.forced.len());
            }
            if !report.attempts.is_empty() {
                debug!(
                    "Stop pass: {} process(es), escalated={}",
                    report.attempts.len(),
                    report.escalated
                );
            }
            if tokio::time::timeout(STOP_POLL, &mut task).await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                warn!("Run task did not exit after stop, aborting it");
                task.abort();
                let _ = task.await;
                break;
            }
        }

        if !self.registry.is_empty() {
            self.registry.terminate_all(self.settings.grace).await;
        }

        let mut output = active.output;
        let dropped = output.discard();
        debug!("Discarded {} buffered line(s)", dropped);

        self.state = RunState::Idle;
        info!("Run stopped");
        Ok(())
    }

    fn worker_pool(&self, workers: usize) -> WorkerPool {
        WorkerPool::new(self.supervisor.clone(), &self.settings.results_root)
            .with_workers(workers)
            .with_timeout(self.settings.scenario_timeout)
            .with_template(self.settings.scenario_command.clone())
            .with_env(self.settings.env.clone())
            .with_corpus_dir(&self.settings.corpus_dir)
    }
}

impl Drop for RunController {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            warn!("Controller dropped during a run, aborting it");
            active.cancel.store(true, Ordering::SeqCst);
            active.task.abort();
        }
    }
}

async fn run_parallel(
    discoverer: Discoverer,
    pool: WorkerPool,
    tags: Option<String>,
    cancel: Arc<AtomicBool>,
    sink: OutputSender,
) -> Result<Vec<ExecutionResult>> {
    sink.line(format!(
        "Discovering scenarios in {}",
        discoverer.corpus_root().display()
    ));
    let scenarios = discoverer.discover(tags.as_deref()).await;
    if scenarios.is_empty() {
        sink.line("No scenarios found");
        sink.complete();
        return Err(Error::NoScenarios);
    }

    sink.line(format!(
        "Found {} scenario(s), running on {} worker(s)",
        scenarios.len(),
        pool.effective_workers(scenarios.len())
    ));
    let results = pool.run(scenarios, cancel, Some(sink.lines())).await;

    let summary = RunSummary::new(results);
    sink.line(format!(
        "Executed {} scenario(s): {} passed, {} failed, {} timed out",
        summary.total, summary.passed, summary.failed, summary.timed_out
    ));
    sink.complete();
    Ok(summary.results)
}

async fn run_sequential(
    supervisor: Supervisor,
    spec: CommandSpec,
    sink: OutputSender,
) -> Result<Vec<ExecutionResult>> {
    let options = ExecOptions::for_worker(0)
        .with_sink(sink)
        .with_label("corpus");
    let result = supervisor.execute(&spec, options).await;
    Ok(vec![result])
}

/// Timestamped id with a random suffix
fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let random: u32 = rand::random::<u32>() % 10000;
    format!("{timestamp}_{random:04}")
}
