//! Process supervision
//!
//! Runs one command as an isolated subprocess: output capture and
//! forwarding, hard timeout, graceful or forced stop on request, and a
//! registry entry that lives exactly as long as the process.

#![allow(dead_code)]

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::command::CommandSpec;
use super::registry::{ProcessRegistry, StopRequest};
use super::signal;
use crate::controller::output::OutputSender;
use crate::models::{ExecutionResult, KILLED_EXIT_CODE};
use crate::utils::timer::Timer;

/// Default time a stopped process gets between SIGTERM and SIGKILL
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// How long output readers may run on after the process exited
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Read end of a child's combined stdout and stderr
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// A started process and the pipe carrying its output
pub struct Spawned {
    pub child: Child,
    pub output: Option<OutputStream>,
}

/// Capability to start processes
pub trait ProcessBackend: Send + Sync {
    fn start(&self, spec: &CommandSpec) -> io::Result<Spawned>;
}

/// Spawns real OS processes through tokio
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBackend;

impl ProcessBackend for SystemBackend {
    fn start(&self, spec: &CommandSpec) -> io::Result<Spawned> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        #[cfg(unix)]
        command.process_group(0);

        spawn_with_output(command)
    }
}

/// Spawn with stdout and stderr sharing one pipe so lines keep program order
#[cfg(unix)]
fn spawn_with_output(mut command: Command) -> io::Result<Spawned> {
    use std::os::fd::OwnedFd;
    use tokio::net::unix::pipe;

    let (reader, writer) = std::io::pipe()?;
    command.stdout(writer.try_clone()?).stderr(writer);
    let child = command.spawn()?;
    // Our copies of the write end must close for EOF to follow the process group
    drop(command);

    let output = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
    Ok(Spawned {
        child,
        output: Some(Box::new(output)),
    })
}

/// Without a shared pipe, stderr follows stdout
#[cfg(not(unix))]
fn spawn_with_output(mut command: Command) -> io::Result<Spawned> {
    use tokio::io::AsyncReadExt;

    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = command.spawn()?;
    let output: Option<OutputStream> = match (child.stdout.take(), child.stderr.take()) {
        (Some(out), Some(err)) => Some(Box::new(out.chain(err))),
        (Some(out), None) => Some(Box::new(out)),
        (None, Some(err)) => Some(Box::new(err)),
        (None, None) => None,
    };
    Ok(Spawned { child, output })
}

/// Per-execution settings
#[derive(Debug, Default)]
pub struct ExecOptions {
    pub worker_id: usize,
    pub timeout: Option<Duration>,
    pub sink: Option<OutputSender>,
    /// Name used in results and logs; defaults to the command line
    pub label: Option<String>,
}

impl ExecOptions {
    pub fn for_worker(worker_id: usize) -> Self {
        Self {
            worker_id,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sink(mut self, sink: OutputSender) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Stopped(StopRequest),
}

/// Process supervisor
#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<ProcessRegistry>,
    backend: Arc<dyn ProcessBackend>,
    grace: Duration,
}

impl Supervisor {
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self {
            registry,
            backend: Arc::new(SystemBackend),
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn ProcessBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Run `spec` to completion, timeout or stop.
    ///
    /// Never fails: every problem is reported inside the result.
    pub async fn execute(&self, spec: &CommandSpec, options: ExecOptions) -> ExecutionResult {
        let ExecOptions {
            worker_id,
            timeout,
            sink,
            label,
        } = options;
        let label = label.unwrap_or_else(|| spec.to_string());
        let timer = Timer::start(&label);

        let Spawned { mut child, output } = match self.backend.start(spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                let message = format!("failed to start {}: {}", spec.program, e);
                warn!("[worker {}] {}", worker_id, message);
                if let Some(sink) = sink {
                    sink.line(&message);
                    sink.complete();
                }
                return ExecutionResult::spawn_failed(label, worker_id, message);
            }
        };

        let pid = child.id();
        let (registration, mut stop_rx) =
            match self.registry.register(&label, pid, Some(worker_id)) {
                Ok(registered) => registered,
                Err(e) => {
                    error!("Cannot track {}: {}", label, e);
                    kill_now(&mut child).await;
                    if let Some(sink) = sink {
                        sink.complete();
                    }
                    return ExecutionResult::spawn_failed(label, worker_id, e.to_string());
                }
            };
        debug!(
            "[worker {}] started {} as {} pid={:?}",
            worker_id,
            label,
            registration.id(),
            pid
        );

        let capture = OutputCapture::spawn(output, sink);

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = deadline(timeout) => {
                warn!("[worker {}] {} exceeded {:?}, killing", worker_id, label, timeout.unwrap_or_default());
                kill_now(&mut child).await;
                Outcome::TimedOut
            }
            Some(request) = stop_rx.recv() => {
                match request {
                    StopRequest::Terminate => self.terminate(&mut child).await,
                    StopRequest::Kill => kill_now(&mut child).await,
                }
                Outcome::Stopped(request)
            }
        };

        // The process is reaped on every branch above
        registration.release();

        let output = capture.finish(OUTPUT_DRAIN_TIMEOUT).await;
        let duration_ms = timer.elapsed_ms();

        let result = match outcome {
            Outcome::Exited(Ok(status)) => ExecutionResult::from_exit(
                label,
                worker_id,
                status.code().unwrap_or(KILLED_EXIT_CODE),
                duration_ms,
            ),
            Outcome::Exited(Err(e)) => {
                let mut result =
                    ExecutionResult::from_exit(label, worker_id, KILLED_EXIT_CODE, duration_ms);
                result.message = Some(format!("wait failed: {e}"));
                result
            }
            Outcome::TimedOut => ExecutionResult::timeout(label, worker_id, duration_ms),
            Outcome::Stopped(request) => {
                info!("[worker {}] {} stopped ({:?})", worker_id, label, request);
                ExecutionResult::cancelled(label, worker_id, duration_ms)
            }
        };

        result.with_output(output)
    }

    /// SIGTERM the process group, then SIGKILL once the grace window passes
    async fn terminate(&self, child: &mut Child) {
        let requested = child.id().map(signal::terminate_group).unwrap_or(false);
        if requested {
            match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(_) => {
                    debug!("Process exited within grace window");
                    return;
                }
                Err(_) => warn!(
                    "Process ignored SIGTERM for {}s, killing",
                    self.grace.as_secs_f32()
                ),
            }
        }
        kill_now(child).await;
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("grace", &self.grace)
            .field("registry", &self.registry)
            .finish()
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// Kill the whole process group and reap the child
async fn kill_now(child: &mut Child) {
    if let Some(pid) = child.id() {
        signal::kill_group(pid);
    }
    if let Err(e) = child.start_kill() {
        debug!("start_kill: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap killed process: {}", e);
    }
}

/// Reader task for the combined output pipe
struct OutputCapture {
    task: JoinHandle<String>,
}

impl OutputCapture {
    fn spawn(output: Option<OutputStream>, sink: Option<OutputSender>) -> Self {
        let task = tokio::spawn(async move {
            let mut captured = String::new();

            if let Some(output) = output {
                let mut lines = BufReader::new(output).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            captured.push_str(&line);
                            captured.push('\n');
                            if let Some(sink) = &sink {
                                sink.line(line);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!("Output stream closed: {}", e);
                            break;
                        }
                    }
                }
            }

            if let Some(sink) = sink {
                sink.complete();
            }
            captured
        });

        Self { task }
    }

    /// Wait for EOF on the pipe, at most `limit`
    async fn finish(mut self, limit: Duration) -> String {
        match tokio::time::timeout(limit, &mut self.task).await {
            Ok(Ok(captured)) => captured,
            Ok(Err(e)) => {
                warn!("Output reader failed: {}", e);
                String::new()
            }
            Err(_) => {
                warn!("Output pipe still open {}s after exit, abandoning", limit.as_secs());
                self.task.abort();
                String::new()
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::controller::output::{self, DEFAULT_BATCH_SIZE};
    use crate::models::ExecutionStatus;
    use std::time::Instant;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    fn supervisor() -> Supervisor {
        Supervisor::new(Arc::new(ProcessRegistry::new()))
    }

    async fn wait_for_registration(registry: &ProcessRegistry) {
        for _ in 0..200 {
            if registry.len() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process never registered");
    }

    /// Refuses every start and remembers what it was asked to run
    #[derive(Default)]
    struct RefusingBackend {
        started: std::sync::Mutex<Vec<String>>,
    }

    impl ProcessBackend for RefusingBackend {
        fn start(&self, spec: &CommandSpec) -> io::Result<Spawned> {
            self.started.lock().unwrap().push(spec.to_string());
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "backend refused"))
        }
    }

    #[tokio::test]
    async fn test_custom_backend() {
        let backend = Arc::new(RefusingBackend::default());
        let supervisor = supervisor().with_backend(backend.clone());

        let result = supervisor
            .execute(&sh("exit 0"), ExecOptions::for_worker(1).with_label("a.feature:1"))
            .await;

        assert_eq!(result.status, ExecutionStatus::Failure);
        assert_eq!(result.scenario, "a.feature:1");
        assert!(result.message.unwrap().contains("backend refused"));
        assert_eq!(backend.started.lock().unwrap().len(), 1);
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_success_captures_output() {
        let supervisor = supervisor();
        let result = supervisor
            .execute(&sh("echo hello; echo oops >&2"), ExecOptions::for_worker(2))
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.worker_id, 2);
        assert_eq!(result.output, "hello\noops\n");
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let supervisor = supervisor();
        let result = supervisor
            .execute(&sh("exit 3"), ExecOptions::default().with_label("a.feature:3"))
            .await;

        assert_eq!(result.status, ExecutionStatus::Failure);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.scenario, "a.feature:3");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let supervisor = supervisor();
        let spec = CommandSpec::new("scenario-runner-no-such-binary");
        let result = supervisor.execute(&spec, ExecOptions::default()).await;

        assert_eq!(result.status, ExecutionStatus::Failure);
        assert_eq!(result.exit_code, KILLED_EXIT_CODE);
        assert!(result.message.unwrap().contains("failed to start"));
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let supervisor = supervisor();
        let started = Instant::now();
        let result = supervisor
            .execute(
                &sh("sleep 30"),
                ExecOptions::default().with_timeout(Some(Duration::from_millis(200))),
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.exit_code, KILLED_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_reaches_grandchildren() {
        let supervisor = supervisor();
        let started = Instant::now();
        let result = supervisor
            .execute(
                &sh("sleep 30 & sleep 30"),
                ExecOptions::default().with_timeout(Some(Duration::from_millis(200))),
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(started.elapsed() < OUTPUT_DRAIN_TIMEOUT + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_terminate_request_cancels() {
        let supervisor = supervisor();
        let registry = Arc::clone(supervisor.registry());

        let running = supervisor.clone();
        let task = tokio::spawn(async move {
            running
                .execute(&sh("sleep 30"), ExecOptions::default())
                .await
        });

        wait_for_registration(&registry).await;
        let report = registry.terminate_all(Duration::from_secs(2)).await;
        let result = task.await.unwrap();

        assert!(report.is_clean());
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_ignored_sigterm_escalates_after_grace() {
        let supervisor = supervisor().with_grace(Duration::from_millis(300));
        let registry = Arc::clone(supervisor.registry());

        let running = supervisor.clone();
        let task = tokio::spawn(async move {
            running
                .execute(
                    &sh("trap '' TERM; while true; do sleep 0.1; done"),
                    ExecOptions::default(),
                )
                .await
        });

        wait_for_registration(&registry).await;
        let started = Instant::now();
        let attempts = registry.signal_all(StopRequest::Terminate);
        assert!(attempts[0].delivered);

        let result = task.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sink_receives_lines_then_sentinel() {
        let supervisor = supervisor();
        let (tx, mut rx) = output::channel();

        let result = supervisor
            .execute(
                &sh("echo A; echo B; echo C"),
                ExecOptions::default().with_sink(tx),
            )
            .await;
        assert!(result.status.is_success());

        let batch = rx.drain_all(DEFAULT_BATCH_SIZE);
        assert_eq!(batch.lines, vec!["A", "B", "C"]);
        assert!(batch.completed);
    }

    #[tokio::test]
    async fn test_interleaved_streams_keep_program_order() {
        let supervisor = supervisor();
        let (tx, mut rx) = output::channel();

        let result = supervisor
            .execute(
                &sh("for i in $(seq 1 300); do echo out$i; echo err$i >&2; done"),
                ExecOptions::default().with_sink(tx),
            )
            .await;
        assert!(result.status.is_success());

        let expected: Vec<String> = (1..=300)
            .flat_map(|i| [format!("out{i}"), format!("err{i}")])
            .collect();
        let batch = rx.drain_all(1000);
        assert!(batch.completed);
        assert_eq!(batch.lines, expected);
        assert_eq!(result.output.lines().collect::<Vec<_>>(), expected);
    }

    #[tokio::test]
    async fn test_spawn_failure_still_completes_sink() {
        let supervisor = supervisor();
        let (tx, mut rx) = output::channel();

        supervisor
            .execute(
                &CommandSpec::new("scenario-runner-no-such-binary"),
                ExecOptions::default().with_sink(tx),
            )
            .await;

        let batch = rx.drain_all(DEFAULT_BATCH_SIZE);
        assert_eq!(batch.lines.len(), 1);
        assert!(batch.completed);
    }
}
