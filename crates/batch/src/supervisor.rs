//! Process supervisor module for av1-batch
//!
//! Tracks every live transcoder process, owns the process-wide cancellation
//! token and the tracker of in-flight tasks, and drives the interrupt
//! escalation: cancel, SIGTERM everything, wait for tasks, SIGKILL leftovers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How long shutdown waits for tasks before killing what is still registered
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Signal sent to a registered process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Cooperative stop (SIGTERM)
    Terminate,
    /// Forced stop (SIGKILL)
    Kill,
}

/// Error type for signal delivery
#[derive(Debug, Error)]
pub enum SignalError {
    /// The process already exited
    #[error("process {0} no longer exists")]
    NoSuchProcess(u32),

    /// The OS refused to deliver the signal
    #[error("failed to signal process {pid}: {reason}")]
    Delivery { pid: u32, reason: String },

    /// Signals by pid are not available on this platform
    #[error("process signals are not supported on this platform")]
    Unsupported,
}

/// Send `signal` to process `pid`.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: StopSignal) -> Result<(), SignalError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| SignalError::NoSuchProcess(pid))?;
    let sig = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    match kill(Pid::from_raw(raw), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(SignalError::NoSuchProcess(pid)),
        Err(e) => Err(SignalError::Delivery {
            pid,
            reason: e.to_string(),
        }),
    }
}

/// Send `signal` to process `pid`.
///
/// Tasks stop their own children through the cancellation token here.
#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _signal: StopSignal) -> Result<(), SignalError> {
    Err(SignalError::Unsupported)
}

/// Registry entry for one live transcoder process
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    /// What the process is working on, for log lines
    pub label: String,
    /// When the process was registered
    pub started_at: Instant,
}

/// Summary of one shutdown pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Processes sent SIGTERM
    pub signaled: usize,
    /// Processes sent SIGKILL
    pub killed: usize,
    /// All tasks finished inside the grace period
    pub drained: bool,
    /// Shutdown escalated to SIGKILL (timeout or repeated interrupt)
    pub forced: bool,
}

/// Process-wide supervisor shared by the scheduler and every task
pub struct Supervisor {
    /// Cancellation context observed by every task
    token: CancellationToken,
    /// Live processes keyed by pid
    registry: Mutex<HashMap<u32, ProcessEntry>>,
    /// In-flight transcode tasks
    tracker: TaskTracker,
    /// Bound on the wait for tasks during shutdown
    shutdown_grace: Duration,
    /// Set by the first shutdown call
    shutdown_started: AtomicBool,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_GRACE)
    }
}

impl Supervisor {
    /// Create a supervisor with the given shutdown grace period
    pub fn new(shutdown_grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            registry: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shutdown_grace,
            shutdown_started: AtomicBool::new(false),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<u32, ProcessEntry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A handle on the cancellation context
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Flip the cancellation context. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Tracker of in-flight tasks
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Spawn a task that shutdown will wait for
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Register a live process. The process is unregistered when the returned
    /// guard is dropped or released.
    pub fn register(&self, pid: u32, label: impl Into<String>) -> Registration<'_> {
        let entry = ProcessEntry {
            label: label.into(),
            started_at: Instant::now(),
        };
        self.registry().insert(pid, entry);
        debug!(pid, "registered process");
        Registration {
            supervisor: self,
            pid,
        }
    }

    fn unregister(&self, pid: u32) {
        if let Some(entry) = self.registry().remove(&pid) {
            debug!(
                pid,
                label = %entry.label,
                elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
                "unregistered process"
            );
        }
    }

    /// Number of registered processes
    pub fn live_count(&self) -> usize {
        self.registry().len()
    }

    /// Pids of all registered processes
    pub fn registered_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.registry().keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Send `signal` to every registered process while holding the registry
    /// lock. Returns how many processes were signaled.
    pub fn signal_all(&self, signal: StopSignal) -> usize {
        let registry = self.registry();
        let mut delivered = 0;
        for (pid, entry) in registry.iter() {
            match send_signal(*pid, signal) {
                Ok(()) => {
                    info!(pid, label = %entry.label, ?signal, "signaled process");
                    delivered += 1;
                }
                Err(SignalError::NoSuchProcess(_)) => {
                    debug!(pid, "process exited before it could be signaled");
                }
                Err(e) => warn!(pid, error = %e, "failed to signal process"),
            }
        }
        delivered
    }

    /// SIGKILL every registered process. Returns how many were signaled.
    pub fn force_kill_all(&self) -> usize {
        self.signal_all(StopSignal::Kill)
    }

    /// Run the interrupt escalation.
    ///
    /// 1. Cancel the context so queued tasks decline to start
    /// 2. SIGTERM every registered process
    /// 3. Wait for in-flight tasks, bounded by the grace period
    /// 4. SIGKILL whatever is still registered if the wait timed out
    ///
    /// A second call while the first is still running kills every registered
    /// process immediately and returns.
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            let killed = self.force_kill_all();
            warn!(killed, "repeated interrupt, killing all transcoders");
            return ShutdownReport {
                killed,
                forced: true,
                ..ShutdownReport::default()
            };
        }

        self.cancel();
        self.tracker.close();

        let signaled = self.signal_all(StopSignal::Terminate);
        info!(signaled, "cancellation requested, waiting for transcoders to stop");

        let drained = tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_ok();

        if drained {
            info!("all transcode tasks stopped");
            return ShutdownReport {
                signaled,
                drained,
                ..ShutdownReport::default()
            };
        }

        warn!(
            grace_secs = self.shutdown_grace.as_secs_f64(),
            remaining = ?self.registered_pids(),
            "tasks still running after grace period, killing"
        );
        let killed = self.force_kill_all();
        ShutdownReport {
            signaled,
            killed,
            drained,
            forced: true,
        }
    }
}

/// Registry membership of one live process
///
/// Dropping the guard unregisters the process.
#[must_use = "dropping the registration unregisters the process"]
pub struct Registration<'a> {
    supervisor: &'a Supervisor,
    pid: u32,
}

impl Registration<'_> {
    /// Pid of the registered process
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Unregister now
    pub fn release(self) {}
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.supervisor.unregister(self.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_registration_guard_unregisters() {
        let supervisor = Supervisor::default();

        let first = supervisor.register(4_000_001, "a.mov");
        let second = supervisor.register(4_000_002, "b.mov");
        assert_eq!(supervisor.live_count(), 2);
        assert_eq!(supervisor.registered_pids(), vec![4_000_001, 4_000_002]);

        first.release();
        assert_eq!(supervisor.registered_pids(), vec![4_000_002]);

        drop(second);
        assert_eq!(supervisor.live_count(), 0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let supervisor = Supervisor::default();
        let token = supervisor.token();
        assert!(!supervisor.is_cancelled());

        supervisor.cancel();
        supervisor.cancel();

        assert!(supervisor.is_cancelled());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_without_tasks_drains_immediately() {
        let supervisor = Supervisor::new(Duration::from_secs(5));
        let start = Instant::now();

        let report = supervisor.shutdown().await;

        assert!(supervisor.is_cancelled());
        assert_eq!(
            report,
            ShutdownReport {
                signaled: 0,
                killed: 0,
                drained: true,
                forced: false,
            }
        );
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_tracked_tasks() {
        let supervisor = Arc::new(Supervisor::new(Duration::from_secs(5)));
        let token = supervisor.token();
        supervisor.spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let report = supervisor.shutdown().await;
        assert!(report.drained);
        assert!(supervisor.tracker().is_empty());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use tokio::process::Command;

        fn spawn_supervised(supervisor: &Arc<Supervisor>, script: &str) -> u32 {
            let mut child = Command::new("sh")
                .arg("-c")
                .arg(script)
                .kill_on_drop(true)
                .spawn()
                .unwrap();
            let pid = child.id().unwrap();
            let task_supervisor = supervisor.clone();
            supervisor.spawn(async move {
                let registration = task_supervisor.register(pid, "test child");
                let _ = child.wait().await;
                registration.release();
            });
            pid
        }

        async fn wait_registered(supervisor: &Supervisor, count: usize) {
            for _ in 0..100 {
                if supervisor.live_count() == count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("expected {} registered processes", count);
        }

        #[test]
        fn test_signal_missing_process() {
            // Far above any kernel's pid_max
            let result = send_signal(i32::MAX as u32, StopSignal::Terminate);
            assert!(matches!(result, Err(SignalError::NoSuchProcess(_))));
        }

        #[tokio::test]
        async fn test_shutdown_terminates_registered_processes() {
            let supervisor = Arc::new(Supervisor::new(Duration::from_secs(5)));
            spawn_supervised(&supervisor, "exec sleep 30");
            spawn_supervised(&supervisor, "exec sleep 30");
            wait_registered(&supervisor, 2).await;

            let report = supervisor.shutdown().await;

            assert_eq!(report.signaled, 2);
            assert!(report.drained);
            assert!(!report.forced);
            assert_eq!(supervisor.live_count(), 0);
        }

        #[tokio::test]
        async fn test_shutdown_kills_processes_ignoring_sigterm() {
            let supervisor = Arc::new(Supervisor::new(Duration::from_millis(300)));
            spawn_supervised(&supervisor, "trap '' TERM; exec sleep 30");
            wait_registered(&supervisor, 1).await;

            let report = supervisor.shutdown().await;

            assert_eq!(report.signaled, 1);
            assert!(!report.drained);
            assert!(report.forced);
            assert_eq!(report.killed, 1);

            // The waiting task observes the kill and unregisters
            tokio::time::timeout(Duration::from_secs(5), supervisor.tracker().wait())
                .await
                .unwrap();
            assert_eq!(supervisor.live_count(), 0);
        }

        #[tokio::test]
        async fn test_second_shutdown_kills_immediately() {
            let supervisor = Arc::new(Supervisor::new(Duration::from_secs(30)));
            spawn_supervised(&supervisor, "trap '' TERM; exec sleep 30");
            wait_registered(&supervisor, 1).await;

            let first = {
                let supervisor = supervisor.clone();
                tokio::spawn(async move { supervisor.shutdown().await })
            };
            tokio::time::sleep(Duration::from_millis(100)).await;

            let second = supervisor.shutdown().await;
            assert!(second.forced);
            assert_eq!(second.killed, 1);

            let first = tokio::time::timeout(Duration::from_secs(5), first)
                .await
                .unwrap()
                .unwrap();
            assert!(first.drained);
            assert_eq!(supervisor.live_count(), 0);
        }
    }
}
