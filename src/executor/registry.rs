//! Process registry
//!
//! Tracks every live supervised subprocess so that a stop request or a
//! controller shutdown can reach all of them. The registry never owns a
//! child: an entry holds identity and a stop channel only. Supervisors
//! acquire a [`Registration`] on spawn and the guard releases the entry on
//! every exit path.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::signal;
use crate::error::{Error, Result};

/// Extra time given to supervisors to observe a stop and unregister
const SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Polling interval while waiting for the registry to drain
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Exit status used after a signal-triggered cleanup
pub const SIGNAL_EXIT_CODE: i32 = 130;

/// Identity of one supervised execution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

/// What a supervisor is asked to do with its child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopRequest {
    /// Graceful termination with the grace window, then forced kill
    Terminate,
    /// Immediate forced kill
    Kill,
}

struct Entry {
    label: String,
    pid: Option<u32>,
    worker_id: Option<usize>,
    started_at: Instant,
    stop_tx: mpsc::UnboundedSender<StopRequest>,
}

/// Read-only view of a registry entry
#[derive(Clone, Debug)]
pub struct ProcessInfo {
    pub id: ExecutionId,
    pub label: String,
    pub pid: Option<u32>,
    pub worker_id: Option<usize>,
    pub running_for: Duration,
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.label)?;
        if let Some(worker) = self.worker_id {
            write!(f, " [worker {worker}]")?;
        }
        if let Some(pid) = self.pid {
            write!(f, " pid={pid}")?;
        }
        write!(f, " running {:.1}s", self.running_for.as_secs_f64())
    }
}

/// Outcome of asking one process to stop
#[derive(Clone, Debug)]
pub struct StopAttempt {
    pub id: ExecutionId,
    pub label: String,
    pub delivered: bool,
}

/// What a registry-wide termination did
#[derive(Clone, Debug, Default)]
pub struct CleanupReport {
    pub attempts: Vec<StopAttempt>,
    pub escalated: bool,
    /// Entries removed by the registry itself because no supervisor released them
    pub forced: Vec<ExecutionId>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty()
    }

    pub fn undelivered(&self) -> impl Iterator<Item = &StopAttempt> {
        self.attempts.iter().filter(|a| !a.delivered)
    }
}

/// Set of live supervised processes
pub struct ProcessRegistry {
    entries: Mutex<HashMap<ExecutionId, Entry>>,
    next_id: AtomicU64,
    hook_installed: AtomicBool,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            hook_installed: AtomicBool::new(false),
        }
    }

    /// Lock for removal paths: cleanup must keep working after a panic elsewhere
    fn lock_for_cleanup(&self) -> MutexGuard<'_, HashMap<ExecutionId, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a freshly spawned process.
    ///
    /// Returns the guard that removes the entry again and the receiving
    /// end of the entry's stop channel.
    pub fn register(
        self: &Arc<Self>,
        label: impl Into<String>,
        pid: Option<u32>,
        worker_id: Option<usize>,
    ) -> Result<(Registration, mpsc::UnboundedReceiver<StopRequest>)> {
        let id = ExecutionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let label = label.into();

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::registry("registry lock poisoned"))?;
        debug!("Registering {} ({}) pid={:?}", id, label, pid);
        entries.insert(
            id,
            Entry {
                label,
                pid,
                worker_id,
                started_at: Instant::now(),
                stop_tx,
            },
        );

        Ok((
            Registration {
                id,
                registry: Arc::clone(self),
                released: false,
            },
            stop_rx,
        ))
    }

    /// Remove an entry. Removing an absent entry is a no-op returning `false`.
    pub fn unregister(&self, id: ExecutionId) -> bool {
        let removed = self.lock_for_cleanup().remove(&id).is_some();
        if removed {
            debug!("Unregistered {}", id);
        } else {
            debug!("{} already unregistered", id);
        }
        removed
    }

    #[cfg(test)]
    fn contains(&self, id: ExecutionId) -> bool {
        self.lock_for_cleanup().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock_for_cleanup().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .lock_for_cleanup()
            .iter()
            .map(|(id, entry)| ProcessInfo {
                id: *id,
                label: entry.label.clone(),
                pid: entry.pid,
                worker_id: entry.worker_id,
                running_for: entry.started_at.elapsed(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Ask every live process to stop, reporting per entry
    pub fn signal_all(&self, request: StopRequest) -> Vec<StopAttempt> {
        let entries = self.lock_for_cleanup();
        let mut attempts: Vec<StopAttempt> = entries
            .iter()
            .map(|(id, entry)| StopAttempt {
                id: *id,
                label: entry.label.clone(),
                delivered: entry.stop_tx.send(request).is_ok(),
            })
            .collect();
        attempts.sort_by_key(|a| a.id);
        attempts
    }

    /// Wait until every entry has been released, or the timeout passes
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    /// Terminate every live process: graceful stop first, forced kill for
    /// anything still registered after the grace window, and finally
    /// direct removal of entries nobody released.
    pub async fn terminate_all(&self, grace: Duration) -> CleanupReport {
        let mut report = CleanupReport {
            attempts: self.signal_all(StopRequest::Terminate),
            ..Default::default()
        };
        if report.attempts.is_empty() {
            return report;
        }

        info!(
            "Terminating {} supervised process(es), grace {}s",
            report.attempts.len(),
            grace.as_secs()
        );

        if self.wait_until_empty(grace + SETTLE_TIMEOUT).await {
            return report;
        }

        warn!("Processes still alive after grace window, escalating to kill");
        report.escalated = true;
        self.signal_all(StopRequest::Kill);

        if !self.wait_until_empty(SETTLE_TIMEOUT).await {
            report.forced = self.force_kill_stragglers();
        }
        report
    }

    /// Kill remaining process groups by pid and drop their entries
    fn force_kill_stragglers(&self) -> Vec<ExecutionId> {
        let stragglers: Vec<(ExecutionId, Entry)> = self.lock_for_cleanup().drain().collect();
        let mut forced = Vec::with_capacity(stragglers.len());

        for (id, entry) in stragglers {
            let killed = entry.pid.map(signal::kill_group).unwrap_or(false);
            error!(
                "Force-removing {} ({}) pid={:?} killed={}",
                id, entry.label, entry.pid, killed
            );
            forced.push(id);
        }
        forced
    }

    /// Install the shutdown hook: on SIGINT/SIGTERM every live process is
    /// terminated before the controller exits. Only the first call installs.
    pub fn install_exit_hook(self: &Arc<Self>, grace: Duration) -> bool {
        if self.hook_installed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let signal_name = shutdown_signal().await;
            warn!("Received {}, stopping {} live process(es)", signal_name, registry.len());
            for info in registry.snapshot() {
                debug!("Stopping {}", info);
            }
            let report = registry.terminate_all(grace).await;
            for attempt in report.undelivered() {
                warn!("{} ({}) had already exited", attempt.id, attempt.label);
            }
            std::process::exit(SIGNAL_EXIT_CODE);
        });
        true
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessRegistry {
    fn drop(&mut self) {
        let entries = self
            .entries
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (id, entry) in entries.drain() {
            let killed = entry.pid.map(signal::kill_group).unwrap_or(false);
            warn!("{} ({}) outlived the registry, killed={}", id, entry.label, killed);
        }
    }
}

impl fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("live", &self.len())
            .finish()
    }
}

/// Resolve on the first SIGINT or SIGTERM, naming the signal
#[cfg(unix)]
pub async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl-C"
}

/// Scoped registry entry: dropping it unregisters the process
#[derive(Debug)]
pub struct Registration {
    id: ExecutionId,
    registry: Arc<ProcessRegistry>,
    released: bool,
}

impl Registration {
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// Release explicitly; the drop that follows does nothing
    pub fn release(mut self) -> bool {
        self.released = true;
        self.registry.unregister(self.id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.released {
            self.registry.unregister(self.id);
        }
    }
}
