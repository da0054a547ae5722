//! Worker pool dispatch
//!
//! Spreads scenarios over a fixed number of workers. Scenario `i` goes to
//! worker `i % workers`, and each worker id is served by one lane that runs
//! its scenarios one after another, so a result partition is never written
//! by two processes at once.

use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::command::{CommandTemplate, EnvForwarding};
use super::supervisor::{ExecOptions, Supervisor};
use crate::controller::output::LineSender;
use crate::error::{Error, Result};
use crate::models::{ExecutionResult, ScenarioRef};
use crate::results::artifacts;
use crate::utils::timer::Timer;

/// Default pool size
pub const DEFAULT_WORKERS: usize = 3;

/// Default hard timeout per scenario
pub const DEFAULT_SCENARIO_TIMEOUT: Duration = Duration::from_secs(300);

/// Parallel scenario dispatcher
#[derive(Clone, Debug)]
pub struct WorkerPool {
    supervisor: Supervisor,
    template: CommandTemplate,
    env: EnvForwarding,
    results_root: PathBuf,
    corpus_dir: Option<PathBuf>,
    workers: usize,
    timeout: Option<Duration>,
}

impl WorkerPool {
    pub fn new(supervisor: Supervisor, results_root: impl AsRef<Path>) -> Self {
        Self {
            supervisor,
            template: CommandTemplate::behave_scenario(),
            env: EnvForwarding::default(),
            results_root: artifacts::absolutize(results_root.as_ref()),
            corpus_dir: None,
            workers: DEFAULT_WORKERS,
            timeout: Some(DEFAULT_SCENARIO_TIMEOUT),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// `None` disables the per-scenario timeout
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_template(mut self, template: CommandTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_env(mut self, env: EnvForwarding) -> Self {
        self.env = env;
        self
    }

    /// Directory scenario processes are started in
    pub fn with_corpus_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.corpus_dir = Some(dir.into());
        self
    }

    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    /// Pool size actually used for `scenario_count` scenarios
    pub fn effective_workers(&self, scenario_count: usize) -> usize {
        self.workers.clamp(1, scenario_count.max(1))
    }

    /// Purge stale artifacts and create one partition per worker
    pub fn prepare(&self) -> Result<()> {
        artifacts::prepare_partitions(&self.results_root, self.workers).map_err(|e| {
            Error::infrastructure(format!(
                "cannot prepare {}: {}",
                self.results_root.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// Run every scenario, returning results in completion order.
    ///
    /// Scenarios not yet started when `cancel` is raised are skipped.
    pub async fn run(
        &self,
        scenarios: Vec<ScenarioRef>,
        cancel: Arc<AtomicBool>,
        progress: Option<LineSender>,
    ) -> Vec<ExecutionResult> {
        if scenarios.is_empty() {
            return Vec::new();
        }

        let workers = self.effective_workers(scenarios.len());
        let total = scenarios.len();
        info!(
            "Dispatching {} scenario(s) across {} worker(s)",
            total, workers
        );
        let timer = Timer::start("dispatch");

        let mut queues: Vec<Vec<ScenarioRef>> = vec![Vec::new(); workers];
        for (index, scenario) in scenarios.into_iter().enumerate() {
            queues[index % workers].push(scenario);
        }

        let pool = Arc::new(self.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handles = Vec::with_capacity(workers);

        for (worker_id, queue) in queues.into_iter().enumerate() {
            let lane = Lane {
                pool: Arc::clone(&pool),
                worker_id,
                cancel: Arc::clone(&cancel),
                results: tx.clone(),
                progress: progress.clone(),
            };
            handles.push(tokio::spawn(lane.run(queue)));
        }
        drop(tx);

        for (worker_id, joined) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = joined {
                error!("Worker {} lane aborted: {}", worker_id, e);
            }
        }

        let mut results = Vec::with_capacity(total);
        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        info!(
            "Dispatch finished: {}/{} result(s) in {}ms",
            results.len(),
            total,
            timer.elapsed_ms()
        );
        results
    }
}

/// Sequential executor for one worker id
struct Lane {
    pool: Arc<WorkerPool>,
    worker_id: usize,
    cancel: Arc<AtomicBool>,
    results: mpsc::UnboundedSender<ExecutionResult>,
    progress: Option<LineSender>,
}

impl Lane {
    async fn run(self, queue: Vec<ScenarioRef>) {
        let partition = artifacts::worker_dir(&self.pool.results_root, self.worker_id);
        if let Err(e) = std::fs::create_dir_all(&partition) {
            error!(
                "[worker {}] cannot create {}: {}, skipping {} scenario(s)",
                self.worker_id,
                partition.display(),
                e,
                queue.len()
            );
            return;
        }

        for scenario in queue {
            if self.cancel.load(Ordering::SeqCst) {
                debug!("[worker {}] cancelled, stopping lane", self.worker_id);
                break;
            }

            let location = scenario.location();
            self.report(format!("[worker {}] running {}", self.worker_id, location));

            let result = self.execute(&scenario, &partition, &location).await;
            self.report(format!("{} {}", result.status, location));

            if self.results.send(result).is_err() {
                break;
            }
        }
    }

    async fn execute(
        &self,
        scenario: &ScenarioRef,
        partition: &Path,
        location: &str,
    ) -> ExecutionResult {
        let pool = &self.pool;
        let mut spec = pool
            .template
            .for_scenario(scenario, partition, self.worker_id)
            .envs(pool.env.resolve(Some(self.worker_id), scenario.tags.as_deref()));
        if let Some(dir) = &pool.corpus_dir {
            spec = spec.current_dir(dir);
        }

        let options = ExecOptions::for_worker(self.worker_id)
            .with_timeout(pool.timeout)
            .with_label(location);
        pool.supervisor.execute(&spec, options).await
    }

    fn report(&self, line: String) {
        if let Some(progress) = &self.progress {
            progress.line(line);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::controller::output;
    use crate::executor::registry::ProcessRegistry;
    use crate::models::ExecutionStatus;
    use tempfile::tempdir;

    fn scenarios(n: usize) -> Vec<ScenarioRef> {
        (0..n)
            .map(|i| ScenarioRef::at_line(format!("features/f{}.feature", i % 3), (i + 1) as u32))
            .collect()
    }

    fn pool(root: &Path, script: &str) -> (WorkerPool, Arc<ProcessRegistry>) {
        let registry = Arc::new(ProcessRegistry::new());
        let pool = WorkerPool::new(Supervisor::new(Arc::clone(&registry)), root)
            .with_template(CommandTemplate::new("sh", ["-c", script]))
            .with_timeout(Some(Duration::from_secs(10)));
        (pool, registry)
    }

    #[tokio::test]
    async fn test_every_scenario_yields_one_result() {
        let dir = tempdir().unwrap();
        let (pool, registry) = pool(dir.path(), "exit 0");
        let pool = pool.with_workers(3);
        pool.prepare().unwrap();

        let results = pool
            .run(scenarios(7), Arc::new(AtomicBool::new(false)), None)
            .await;

        assert_eq!(results.len(), 7);
        assert!(results.iter().all(|r| r.worker_id < 3));
        assert!(results.iter().all(|r| r.status.is_success()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_worker_assignment_is_round_robin() {
        let dir = tempdir().unwrap();
        let (pool, _registry) = pool(dir.path(), "exit 0");
        let pool = pool.with_workers(2);

        let results = pool
            .run(scenarios(4), Arc::new(AtomicBool::new(false)), None)
            .await;

        for result in results {
            let line: usize = result.scenario.rsplit(':').next().unwrap().parse().unwrap();
            assert_eq!(result.worker_id, (line - 1) % 2);
        }
    }

    #[tokio::test]
    async fn test_partitions_are_never_shared() {
        let dir = tempdir().unwrap();
        let script = "if [ -e {output_dir}/lock ]; then exit 9; fi; \
                      touch {output_dir}/lock; sleep 0.05; rm {output_dir}/lock; \
                      echo {scenario} >> {output_dir}/ran.txt";
        let (pool, _registry) = pool(dir.path(), script);
        let pool = pool.with_workers(3);
        pool.prepare().unwrap();

        let results = pool
            .run(scenarios(9), Arc::new(AtomicBool::new(false)), None)
            .await;

        assert_eq!(results.len(), 9);
        assert!(results.iter().all(|r| r.exit_code == 0));
        for worker_id in 0..3 {
            let log = artifacts::worker_dir(dir.path(), worker_id).join("ran.txt");
            assert_eq!(std::fs::read_to_string(log).unwrap().lines().count(), 3);
        }
    }

    #[tokio::test]
    async fn test_failures_and_timeouts_do_not_stop_the_pool() {
        let dir = tempdir().unwrap();
        let script = "case {scenario} in *:1) exit 1;; *:2) sleep 30;; esac";
        let (pool, registry) = pool(dir.path(), script);
        let pool = pool
            .with_workers(2)
            .with_timeout(Some(Duration::from_millis(300)));

        let results = pool
            .run(scenarios(4), Arc::new(AtomicBool::new(false)), None)
            .await;

        let status_of = |loc: &str| {
            results
                .iter()
                .find(|r| r.scenario.ends_with(loc))
                .map(|r| r.status)
                .unwrap()
        };
        assert_eq!(results.len(), 4);
        assert_eq!(status_of(":1"), ExecutionStatus::Failure);
        assert_eq!(status_of(":2"), ExecutionStatus::Timeout);
        assert_eq!(status_of(":3"), ExecutionStatus::Success);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let dir = tempdir().unwrap();
        let (pool, _registry) = pool(dir.path(), "exit 0");

        let results = pool.run(scenarios(5), Arc::new(AtomicBool::new(true)), None).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_progress_lines() {
        let dir = tempdir().unwrap();
        let (pool, _registry) = pool(dir.path(), "exit 0");
        let pool = pool.with_workers(1);
        let (tx, mut rx) = output::channel();

        pool.run(scenarios(1), Arc::new(AtomicBool::new(false)), Some(tx.lines()))
            .await;
        tx.complete();

        let batch = rx.drain_all(output::DEFAULT_BATCH_SIZE);
        assert_eq!(
            batch.lines,
            vec!["[worker 0] running features/f0.feature:1", "PASS features/f0.feature:1"]
        );
        assert!(batch.completed);
    }

    #[test]
    fn test_effective_workers() {
        let registry = Arc::new(ProcessRegistry::new());
        let pool = WorkerPool::new(Supervisor::new(registry), "reports").with_workers(8);
        assert_eq!(pool.effective_workers(3), 3);
        assert_eq!(pool.effective_workers(0), 1);
        assert_eq!(pool.effective_workers(20), 8);
        assert!(pool.results_root().is_absolute());
    }

    #[test]
    fn test_prepare_creates_partitions() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("reports");
        let (pool, _registry) = pool(&root, "exit 0");
        let pool = pool.with_workers(2);

        pool.prepare().unwrap();
        assert!(artifacts::worker_dir(&root, 0).is_dir());
        assert!(artifacts::worker_dir(&root, 1).is_dir());
    }
}
