//! Batch startup and top-level run for av1-batch
//!
//! Provides the entry point used by the CLI: startup checks, the crash-recovery
//! sweep, enumeration, the scheduled run and interrupt-triggered shutdown.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::marker::{sweep_incomplete, SweepReport};
use crate::report::{announce, Tag};
use crate::scan::enumerate_sources;
use crate::scheduler::{Canceled, RunSummary, Scheduler};
use crate::startup::{check_transcoder_available, validate_root, StartupError};
use crate::supervisor::{ShutdownReport, Supervisor};
use crate::task::TaskSettings;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Error type for batch operations
#[derive(Debug, Error)]
pub enum BatchError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// The run was interrupted
    #[error("Run canceled by interrupt ({0})")]
    Canceled(RunSummary),
}

impl From<Canceled> for BatchError {
    fn from(canceled: Canceled) -> Self {
        BatchError::Canceled(canceled.0)
    }
}

/// Batch state containing all runtime components
pub struct Batch {
    /// Configuration after file, environment and CLI overrides
    pub config: Config,
    /// Derived concurrency plan
    pub plan: ConcurrencyPlan,
    /// Shared supervisor for cancellation and live processes
    supervisor: Arc<Supervisor>,
}

impl Batch {
    /// Initialize the batch and verify the transcoder runs
    ///
    /// # Returns
    /// * `Ok(Batch)` - Transcoder available, plan derived
    /// * `Err(BatchError::Startup)` - `<program> -version` failed
    pub fn new(config: Config) -> Result<Self, BatchError> {
        let program = PathBuf::from(&config.encoder.program);
        match check_transcoder_available(&program)? {
            Some(major) => info!(program = %program.display(), major, "transcoder available"),
            None => warn!(program = %program.display(), "transcoder available, version not recognised"),
        }
        Ok(Self::new_without_checks(config))
    }

    /// Initialize the batch without running startup checks
    ///
    /// Useful for testing when ffmpeg is not installed.
    pub fn new_without_checks(config: Config) -> Self {
        let plan = derive_plan(&config);
        let supervisor = Arc::new(Supervisor::new(Duration::from_secs(
            config.shutdown.shutdown_grace_secs,
        )));
        Self {
            config,
            plan,
            supervisor,
        }
    }

    /// Get the shared supervisor
    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    fn task_settings(&self) -> TaskSettings {
        TaskSettings {
            program: PathBuf::from(&self.config.encoder.program),
            threads: self.plan.threads_per_worker,
            nice_level: self.config.cpu.nice_level,
            grace: Duration::from_secs(self.config.shutdown.task_grace_secs),
        }
    }

    /// Run one batch over `root`
    ///
    /// 1. Validate the root directory
    /// 2. Sweep leftovers of interrupted runs
    /// 3. Enumerate source files
    /// 4. Transcode them with at most `max_workers` in flight
    /// 5. Print the summary
    ///
    /// # Returns
    /// * `Ok(RunSummary)` - Every file reached an outcome
    /// * `Err(BatchError::Canceled)` - Interrupted; the summary was still printed
    /// * `Err(BatchError::Startup)` - Invalid root
    pub async fn run(&self, root: &Path) -> Result<RunSummary, BatchError> {
        let root = validate_root(root)?;

        let sweep = sweep(root.clone()).await;
        if sweep.markers_removed > 0 {
            announce(
                Tag::Cleanup,
                format!(
                    "removed {} leftover marker(s) and {} partial output(s)",
                    sweep.markers_removed, sweep.outputs_removed
                ),
            );
        }

        let extensions = self.config.scan.source_extensions.clone();
        let walk_root = root.clone();
        let sources =
            tokio::task::spawn_blocking(move || enumerate_sources(&walk_root, &extensions))
                .await
                .map_err(|e| StartupError::Io(io::Error::other(e)))?;

        self.print_banner(&root, sources.len());

        let scheduler = Scheduler::new(
            self.supervisor.clone(),
            self.task_settings(),
            self.plan.max_workers,
        );
        let result = scheduler.run(sources).await;
        match &result {
            Ok(summary) | Err(Canceled(summary)) => summary.print(),
        }
        result.map_err(BatchError::from)
    }

    /// Stop the run after an interrupt
    ///
    /// Runs the supervisor escalation, then sweeps `root` so no marker or
    /// partial output survives the process.
    pub async fn shutdown(&self, root: &Path) -> ShutdownReport {
        let report = self.supervisor.shutdown().await;
        let sweep = sweep(root.to_path_buf()).await;
        if sweep.errors > 0 {
            warn!(errors = sweep.errors, "some partial outputs could not be removed");
        }
        info!(
            signaled = report.signaled,
            killed = report.killed,
            markers_removed = sweep.markers_removed,
            "shutdown complete"
        );
        report
    }

    fn print_banner(&self, root: &Path, candidates: usize) {
        let plan = &self.plan;
        println!("Root:        {}", root.display());
        println!("Extensions:  {}", self.config.scan.source_extensions.join(", "));
        println!(
            "CPU:         {} cores, target {}% ({} threads)",
            plan.total_cores, plan.target_percent, plan.target_threads
        );
        println!(
            "Workers:     {} x {} threads, nice {}",
            plan.max_workers, plan.threads_per_worker, self.config.cpu.nice_level
        );
        println!("Found {} source file(s)", candidates);
        println!();
    }
}

async fn sweep(root: PathBuf) -> SweepReport {
    match tokio::task::spawn_blocking(move || sweep_incomplete(&root)).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "crash-recovery sweep aborted");
            SweepReport::default()
        }
    }
}
