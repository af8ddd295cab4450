//! Worker pool for av1-batch
//!
//! Dispatches one [`TranscodeTask`] per source file with at most `max_workers`
//! in flight, contains task panics, and aggregates outcomes into a
//! [`RunSummary`].

use crate::marker;
use crate::report::{announce, Tag};
use crate::scan::SourceFile;
use crate::supervisor::Supervisor;
use crate::task::{TaskOutcome, TaskSettings, TranscodeTask};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Per-outcome counters of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Candidate files found by enumeration
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl RunSummary {
    /// Create an empty summary for `total` candidates
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Success => self.succeeded += 1,
            TaskOutcome::Skipped => self.skipped += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::Canceled => self.canceled += 1,
        }
    }

    /// Number of files with a recorded outcome
    pub fn recorded(&self) -> usize {
        self.succeeded + self.skipped + self.failed + self.canceled
    }

    /// Print the end-of-run summary to stdout
    pub fn print(&self) {
        println!();
        println!("=== Summary ===");
        println!("Files found: {}", self.total);
        println!("Converted:   {}", self.succeeded);
        println!("Skipped:     {}", self.skipped);
        println!("Failed:      {}", self.failed);
        println!("Canceled:    {}", self.canceled);
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files: {} converted, {} skipped, {} failed, {} canceled",
            self.total, self.succeeded, self.skipped, self.failed, self.canceled
        )
    }
}

/// The run was interrupted; the summary covers every candidate anyway
#[derive(Debug, Error)]
#[error("run canceled ({0})")]
pub struct Canceled(pub RunSummary);

/// Bounded dispatcher of transcode tasks
pub struct Scheduler {
    supervisor: Arc<Supervisor>,
    settings: Arc<TaskSettings>,
    max_workers: usize,
}

impl Scheduler {
    /// Create a scheduler
    ///
    /// # Arguments
    /// * `supervisor` - Shared supervisor owning cancellation and the process registry
    /// * `settings` - Transcoder settings handed to every task
    /// * `max_workers` - Ceiling on concurrent tasks (floored at 1)
    pub fn new(supervisor: Arc<Supervisor>, settings: TaskSettings, max_workers: u32) -> Self {
        Self {
            supervisor,
            settings: Arc::new(settings),
            max_workers: max_workers.max(1) as usize,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Transcode every file in `sources`.
    ///
    /// A worker slot is acquired before each task is spawned, so dispatch
    /// blocks while `max_workers` tasks are in flight. Once cancellation is
    /// requested no further task starts; the files not yet dispatched are
    /// recorded as canceled. Returns after every dispatched task finished.
    ///
    /// Sources whose output path is already claimed by an earlier source
    /// (e.g. `clip.mov` and `clip.MOV` in one directory) are recorded as
    /// failed without being dispatched.
    ///
    /// # Returns
    /// * `Ok(RunSummary)` - Every file reached an outcome without interruption
    /// * `Err(Canceled)` - The run was interrupted; carries the full summary
    pub async fn run(&self, sources: Vec<SourceFile>) -> Result<RunSummary, Canceled> {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let summary = Arc::new(Mutex::new(RunSummary::new(sources.len())));
        let (sources, collisions) = claim_outputs(sources);
        {
            let mut summary = summary.lock().unwrap_or_else(PoisonError::into_inner);
            for collision in &collisions {
                warn!(
                    file = %collision.source.path.display(),
                    output = %collision.output.display(),
                    owner = %collision.owner,
                    "output path already claimed"
                );
                announce(
                    Tag::Error,
                    format!(
                        "{}: output {} collides with {}",
                        collision.source.file_name,
                        collision.output.display(),
                        collision.owner
                    ),
                );
                summary.record(TaskOutcome::Failed);
            }
        }
        let token = self.supervisor.token();
        let mut handles = Vec::with_capacity(sources.len());
        let mut pending = sources.into_iter();

        while let Some(source) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };

            let Some(permit) = permit else {
                let mut summary = summary.lock().unwrap_or_else(PoisonError::into_inner);
                for source in std::iter::once(source).chain(pending.by_ref()) {
                    announce(Tag::Cancel, format!("{} (not started)", source.file_name));
                    summary.record(TaskOutcome::Canceled);
                }
                break;
            };

            debug!(file = %source.path.display(), "dispatching task");
            let supervisor = self.supervisor.clone();
            let settings = self.settings.clone();
            let summary = summary.clone();
            handles.push(self.supervisor.spawn(async move {
                let _permit = permit;
                let output = source.output_path();
                let label = source.file_name.clone();
                let task = TranscodeTask::new(source);
                let outcome = guarded(&label, &output, task.run(&supervisor, &settings)).await;
                summary
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(outcome);
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "transcode task aborted");
                summary
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record(TaskOutcome::Failed);
            }
        }

        let summary = summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        debug_assert_eq!(summary.recorded(), summary.total);
        info!(%summary, "run finished");

        if self.supervisor.is_cancelled() {
            Err(Canceled(summary))
        } else {
            Ok(summary)
        }
    }
}

/// A source whose output path was claimed by an earlier source
#[derive(Debug)]
pub(crate) struct OutputCollision {
    pub source: SourceFile,
    pub output: PathBuf,
    /// File name of the source that keeps the output
    pub owner: String,
}

/// Split `sources` into those that own their output path and those that
/// collide with an earlier source. Enumeration order decides the owner.
pub(crate) fn claim_outputs(sources: Vec<SourceFile>) -> (Vec<SourceFile>, Vec<OutputCollision>) {
    let mut owners: HashMap<PathBuf, String> = HashMap::with_capacity(sources.len());
    let mut claimed = Vec::with_capacity(sources.len());
    let mut collisions = Vec::new();

    for source in sources {
        let output = source.output_path();
        match owners.get(&output) {
            Some(owner) => collisions.push(OutputCollision {
                owner: owner.clone(),
                source,
                output,
            }),
            None => {
                owners.insert(output, source.file_name.clone());
                claimed.push(source);
            }
        }
    }

    (claimed, collisions)
}

/// Fault boundary around one task.
///
/// A panic becomes [`TaskOutcome::Failed`]; any output still carrying its
/// marker is discarded.
pub(crate) async fn guarded<F>(label: &str, output: &Path, task: F) -> TaskOutcome
where
    F: Future<Output = TaskOutcome>,
{
    match AssertUnwindSafe(task).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(file = label, panic = %message, "transcode task panicked");
            announce(Tag::Error, format!("{}: task panicked: {}", label, message));
            match marker::discard_if_incomplete(output) {
                Ok(true) => announce(Tag::Cleanup, format!("{} (partial output removed)", label)),
                Ok(false) => {}
                Err(e) => warn!(output = %output.display(), error = %e, "failed to remove partial output"),
            }
            TaskOutcome::Failed
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
