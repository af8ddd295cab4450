//! Transcode task module for av1-batch
//!
//! One task owns the full lifecycle of a single source file: output directory,
//! skip check, incomplete marker, transcoder process, integrity check and
//! cleanup. Tasks never propagate errors; every path ends in a [`TaskOutcome`].

use crate::encode::{spawn_transcoder, EncodeParams};
use crate::marker;
use crate::report::{announce, Tag};
use crate::scan::SourceFile;
use crate::supervisor::{send_signal, SignalError, StopSignal, Supervisor};
use filetime::FileTime;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tracing::{debug, error, info, warn};

/// How long a canceled task waits for its transcoder after SIGTERM
pub const DEFAULT_TASK_GRACE: Duration = Duration::from_secs(5);

/// Error type for a failed transcode
#[derive(Debug, Error)]
pub enum TaskError {
    /// The `converted` directory could not be created
    #[error("failed to create output directory {path}: {source}")]
    CreateOutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A leftover output from an interrupted run could not be removed
    #[error("failed to discard stale output: {0}")]
    DiscardStale(#[source] io::Error),

    /// The incomplete marker could not be written
    #[error("failed to write incomplete marker: {0}")]
    WriteMarker(#[source] io::Error),

    /// The transcoder could not be started
    #[error("failed to start transcoder: {0}")]
    Spawn(#[source] io::Error),

    /// Waiting on the transcoder failed
    #[error("failed to wait for transcoder: {0}")]
    Wait(#[source] io::Error),

    /// The transcoder exited with a non-zero code
    #[error("transcoder exited with code {0}")]
    ExitStatus(i32),

    /// The transcoder was killed by a signal
    #[error("transcoder was terminated by a signal")]
    Terminated,

    /// The transcoder reported success but produced no file
    #[error("output file is missing: {0}")]
    MissingOutput(#[source] io::Error),

    /// The transcoder reported success but produced an empty file
    #[error("output file is empty")]
    EmptyOutput,

    /// The finished output could not be unmarked
    #[error("failed to remove incomplete marker: {0}")]
    RemoveMarker(#[source] io::Error),
}

/// Terminal result of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOutcome {
    /// A finished output was produced
    Success,
    /// A finished output already existed
    Skipped,
    /// The transcode failed; no output is left behind
    Failed,
    /// The run was interrupted before or during the transcode
    Canceled,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Success => "success",
            TaskOutcome::Skipped => "skipped",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Canceled => "canceled",
        }
    }
}

/// Task state representing the current stage of a transcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for a worker slot
    Pending,
    /// Creating the output directory and checking for existing outputs
    Preparing,
    /// Transcoder process is running
    Running,
    /// Output finished and verified
    Succeeded,
    /// Output already existed
    Skipped,
    /// Transcode failed
    Failed,
    /// Transcode interrupted
    Canceled,
}

impl TaskState {
    /// Convert state to string for log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Preparing => "preparing",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Skipped => "skipped",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            TaskState::Pending | TaskState::Preparing | TaskState::Running
        )
    }
}

impl From<TaskOutcome> for TaskState {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Success => TaskState::Succeeded,
            TaskOutcome::Skipped => TaskState::Skipped,
            TaskOutcome::Failed => TaskState::Failed,
            TaskOutcome::Canceled => TaskState::Canceled,
        }
    }
}

/// Settings shared by every task of a run
#[derive(Debug, Clone)]
pub struct TaskSettings {
    /// Transcoder program name or path
    pub program: PathBuf,
    /// Thread budget of one transcoder
    pub threads: u32,
    /// Niceness applied to each transcoder
    pub nice_level: i32,
    /// Wait after SIGTERM before a canceled transcoder is killed
    pub grace: Duration,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            threads: 1,
            nice_level: 19,
            grace: DEFAULT_TASK_GRACE,
        }
    }
}

/// The transcode of one source file
#[derive(Debug)]
pub struct TranscodeTask {
    source: SourceFile,
    output_path: PathBuf,
    state: TaskState,
    /// Set once this task may have created the output or its marker
    owns_output: bool,
}

impl TranscodeTask {
    /// Create a pending task for `source`
    pub fn new(source: SourceFile) -> Self {
        let output_path = source.output_path();
        Self {
            source,
            output_path,
            state: TaskState::Pending,
            owns_output: false,
        }
    }

    pub fn source(&self) -> &SourceFile {
        &self.source
    }

    /// Final output path of this task
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    fn transition(&mut self, next: TaskState) {
        debug!(
            file = %self.source.file_name,
            from = self.state.as_str(),
            to = next.as_str(),
            "task state change"
        );
        self.state = next;
    }

    /// Run the task to completion.
    ///
    /// Errors are announced and mapped to [`TaskOutcome::Failed`] after the
    /// partial output is removed. A finished output that existed before the
    /// task started is never touched.
    pub async fn run(mut self, supervisor: &Supervisor, settings: &TaskSettings) -> TaskOutcome {
        let outcome = match self.execute(supervisor, settings).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(file = %self.source.path.display(), error = %e, "transcode failed");
                announce(Tag::Error, format!("{}: {}", self.source.file_name, e));
                self.discard_output();
                TaskOutcome::Failed
            }
        };
        self.transition(outcome.into());
        debug_assert!(self.state.is_terminal());
        outcome
    }

    async fn execute(
        &mut self,
        supervisor: &Supervisor,
        settings: &TaskSettings,
    ) -> Result<TaskOutcome, TaskError> {
        if supervisor.is_cancelled() {
            announce(Tag::Cancel, format!("{} (not started)", self.source.file_name));
            return Ok(TaskOutcome::Canceled);
        }

        self.transition(TaskState::Preparing);

        let converted_dir = self.source.converted_dir();
        tokio::fs::create_dir_all(&converted_dir)
            .await
            .map_err(|source| TaskError::CreateOutputDir {
                path: converted_dir.clone(),
                source,
            })?;

        if tokio::fs::try_exists(&self.output_path).await.unwrap_or(false) {
            if !marker::is_incomplete(&self.output_path) {
                announce(Tag::Skip, format!("{} (already converted)", self.source.file_name));
                return Ok(TaskOutcome::Skipped);
            }
            warn!(output = %self.output_path.display(), "discarding output of an interrupted run");
            marker::discard_partial(&self.output_path).map_err(TaskError::DiscardStale)?;
            announce(Tag::Cleanup, format!("{} (stale output removed)", self.source.file_name));
        }

        announce(
            Tag::Start,
            format!("{} (threads={})", self.source.file_name, settings.threads),
        );

        self.owns_output = true;
        marker::write_marker(&self.output_path, &self.source.path).map_err(TaskError::WriteMarker)?;

        self.transition(TaskState::Running);
        let params = EncodeParams::new(
            settings.program.clone(),
            self.source.path.clone(),
            self.output_path.clone(),
            settings.threads,
            settings.nice_level,
        );
        let mut child = spawn_transcoder(&params).map_err(TaskError::Spawn)?;
        let registration = child
            .id()
            .map(|pid| supervisor.register(pid, self.source.file_name.clone()));

        let token = supervisor.token();
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = token.cancelled() => None,
        };

        let status = match waited {
            Some(status) => status,
            None => {
                if let Err(e) = stop_child(&mut child, settings.grace).await {
                    warn!(file = %self.source.file_name, error = %e, "failed to stop transcoder");
                }
                drop(registration);
                return Ok(self.cancel());
            }
        };
        drop(registration);

        let status = status.map_err(TaskError::Wait)?;
        if !status.success() {
            // A transcoder stopped by the shutdown escalation counts as canceled
            if supervisor.is_cancelled() {
                return Ok(self.cancel());
            }
            return Err(exit_error(status));
        }

        let metadata = tokio::fs::metadata(&self.output_path)
            .await
            .map_err(TaskError::MissingOutput)?;
        if metadata.len() == 0 {
            return Err(TaskError::EmptyOutput);
        }

        marker::remove_marker(&self.output_path).map_err(TaskError::RemoveMarker)?;
        self.owns_output = false;

        if let Err(e) = copy_mtime(&self.source.path, &self.output_path) {
            warn!(output = %self.output_path.display(), error = %e, "failed to copy modification time");
        }

        info!(
            file = %self.source.path.display(),
            bytes = metadata.len(),
            "transcode finished"
        );
        announce(
            Tag::Done,
            format!("{} -> {}", self.source.file_name, self.output_path.display()),
        );
        Ok(TaskOutcome::Success)
    }

    fn cancel(&mut self) -> TaskOutcome {
        self.discard_output();
        announce(Tag::Cancel, &self.source.file_name);
        TaskOutcome::Canceled
    }

    /// Remove the output and marker this task may have created.
    fn discard_output(&mut self) {
        if !self.owns_output {
            return;
        }
        self.owns_output = false;
        match marker::discard_partial(&self.output_path) {
            Ok(true) => announce(
                Tag::Cleanup,
                format!("{} (partial output removed)", self.source.file_name),
            ),
            Ok(false) => {}
            Err(e) => warn!(
                output = %self.output_path.display(),
                error = %e,
                "failed to remove partial output"
            ),
        }
    }
}

/// Ask the transcoder to stop, escalating to a kill after `grace`.
async fn stop_child(child: &mut Child, grace: Duration) -> io::Result<Option<ExitStatus>> {
    let requested = match child.id() {
        Some(pid) => match send_signal(pid, StopSignal::Terminate) {
            Ok(()) => true,
            Err(SignalError::NoSuchProcess(_)) => true,
            Err(e) => {
                debug!(pid, error = %e, "could not request transcoder stop");
                false
            }
        },
        // Already reaped
        None => return Ok(None),
    };

    if requested {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status.map(Some),
            Err(_) => warn!(
                grace_secs = grace.as_secs_f64(),
                "transcoder ignored SIGTERM, killing"
            ),
        }
    }

    child.kill().await?;
    Ok(None)
}

fn exit_error(status: ExitStatus) -> TaskError {
    match status.code() {
        Some(code) => TaskError::ExitStatus(code),
        None => TaskError::Terminated,
    }
}

/// Give `output` the modification time of `source`.
fn copy_mtime(source: &Path, output: &Path) -> io::Result<()> {
    let metadata = std::fs::metadata(source)?;
    filetime::set_file_mtime(output, FileTime::from_last_modification_time(&metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_as_str() {
        assert_eq!(TaskState::Pending.as_str(), "pending");
        assert_eq!(TaskState::Preparing.as_str(), "preparing");
        assert_eq!(TaskState::Running.as_str(), "running");
        assert_eq!(TaskState::Succeeded.as_str(), "succeeded");
        assert_eq!(TaskState::Skipped.as_str(), "skipped");
        assert_eq!(TaskState::Failed.as_str(), "failed");
        assert_eq!(TaskState::Canceled.as_str(), "canceled");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        for outcome in [
            TaskOutcome::Success,
            TaskOutcome::Skipped,
            TaskOutcome::Failed,
            TaskOutcome::Canceled,
        ] {
            assert!(TaskState::from(outcome).is_terminal(), "{}", outcome.as_str());
        }
    }

    #[test]
    fn test_new_task_is_pending() {
        let source = SourceFile::new("/media/clip.MOV").unwrap();
        let task = TranscodeTask::new(source);
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.output_path(), Path::new("/media/converted/clip.mkv"));
    }

    #[tokio::test]
    async fn test_precanceled_task_does_nothing() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("clip.mov");
        std::fs::write(&path, b"source").unwrap();

        let supervisor = Supervisor::default();
        supervisor.cancel();

        let task = TranscodeTask::new(SourceFile::new(&path).unwrap());
        let outcome = task.run(&supervisor, &TaskSettings::default()).await;

        assert_eq!(outcome, TaskOutcome::Canceled);
        assert!(!temp_dir.path().join("converted").exists());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;
        use std::time::Instant;
        use tempfile::TempDir;

        /// Writes an executable stand-in for ffmpeg. `$out` holds the output
        /// path (the last argument).
        fn fake_transcoder(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-ffmpeg");
            fs::write(&path, format!("#!/bin/sh\nfor out; do :; done\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn settings(program: PathBuf) -> TaskSettings {
            TaskSettings {
                program,
                threads: 2,
                nice_level: 10,
                grace: Duration::from_millis(300),
            }
        }

        fn source_in(dir: &Path, name: &str) -> SourceFile {
            let media = dir.join("media");
            fs::create_dir_all(&media).unwrap();
            let path = media.join(name);
            fs::write(&path, b"source video").unwrap();
            SourceFile::new(path).unwrap()
        }

        #[tokio::test]
        async fn test_successful_transcode() {
            let temp_dir = TempDir::new().unwrap();
            let program = fake_transcoder(temp_dir.path(), "printf 'encoded' > \"$out\"");
            let source = source_in(temp_dir.path(), "clip.MOV");
            let mtime = FileTime::from_unix_time(1_600_000_000, 0);
            filetime::set_file_mtime(&source.path, mtime).unwrap();
            let output = source.output_path();

            let supervisor = Supervisor::default();
            let outcome = TranscodeTask::new(source)
                .run(&supervisor, &settings(program))
                .await;

            assert_eq!(outcome, TaskOutcome::Success);
            assert_eq!(fs::read(&output).unwrap(), b"encoded");
            assert!(!marker::is_incomplete(&output));
            let out_meta = fs::metadata(&output).unwrap();
            assert_eq!(FileTime::from_last_modification_time(&out_meta), mtime);
            assert_eq!(supervisor.live_count(), 0);
        }

        #[tokio::test]
        async fn test_marker_exists_while_transcoder_runs() {
            let temp_dir = TempDir::new().unwrap();
            let program = fake_transcoder(
                temp_dir.path(),
                "[ -f \"$out.incomplete\" ] || exit 9\nprintf 'encoded' > \"$out\"",
            );
            let source = source_in(temp_dir.path(), "clip.mov");

            let outcome = TranscodeTask::new(source)
                .run(&Supervisor::default(), &settings(program))
                .await;

            assert_eq!(outcome, TaskOutcome::Success);
        }

        #[tokio::test]
        async fn test_existing_output_is_skipped() {
            let temp_dir = TempDir::new().unwrap();
            let source = source_in(temp_dir.path(), "clip.mov");
            let output = source.output_path();
            fs::create_dir_all(output.parent().unwrap()).unwrap();
            fs::write(&output, b"finished earlier").unwrap();

            // The program does not exist, so any spawn attempt would fail
            let program = temp_dir.path().join("no-such-ffmpeg");
            let outcome = TranscodeTask::new(source)
                .run(&Supervisor::default(), &settings(program))
                .await;

            assert_eq!(outcome, TaskOutcome::Skipped);
            assert_eq!(fs::read(&output).unwrap(), b"finished earlier");
        }

        #[tokio::test]
        async fn test_stale_output_is_reprocessed() {
            let temp_dir = TempDir::new().unwrap();
            let program = fake_transcoder(temp_dir.path(), "printf 'fresh' > \"$out\"");
            let source = source_in(temp_dir.path(), "clip.mov");
            let output = source.output_path();
            fs::create_dir_all(output.parent().unwrap()).unwrap();
            fs::write(&output, b"half").unwrap();
            marker::write_marker(&output, &source.path).unwrap();

            let outcome = TranscodeTask::new(source)
                .run(&Supervisor::default(), &settings(program))
                .await;

            assert_eq!(outcome, TaskOutcome::Success);
            assert_eq!(fs::read(&output).unwrap(), b"fresh");
            assert!(!marker::is_incomplete(&output));
        }

        #[tokio::test]
        async fn test_nonzero_exit_fails_and_cleans_up() {
            let temp_dir = TempDir::new().unwrap();
            let program = fake_transcoder(temp_dir.path(), "printf 'x' > \"$out\"\nexit 3");
            let source = source_in(temp_dir.path(), "clip.mov");
            let output = source.output_path();

            let outcome = TranscodeTask::new(source)
                .run(&Supervisor::default(), &settings(program))
                .await;

            assert_eq!(outcome, TaskOutcome::Failed);
            assert!(!output.exists());
            assert!(!marker::is_incomplete(&output));
            // The output directory itself stays
            assert!(output.parent().unwrap().is_dir());
        }

        #[tokio::test]
        async fn test_empty_output_fails() {
            let temp_dir = TempDir::new().unwrap();
            let program = fake_transcoder(temp_dir.path(), ": > \"$out\"");
            let source = source_in(temp_dir.path(), "clip.mov");
            let output = source.output_path();

            let outcome = TranscodeTask::new(source)
                .run(&Supervisor::default(), &settings(program))
                .await;

            assert_eq!(outcome, TaskOutcome::Failed);
            assert!(!output.exists());
            assert!(!marker::is_incomplete(&output));
        }

        #[tokio::test]
        async fn test_missing_output_fails() {
            let temp_dir = TempDir::new().unwrap();
            let program = fake_transcoder(temp_dir.path(), "exit 0");
            let source = source_in(temp_dir.path(), "clip.mov");
            let output = source.output_path();

            let outcome = TranscodeTask::new(source)
                .run(&Supervisor::default(), &settings(program))
                .await;

            assert_eq!(outcome, TaskOutcome::Failed);
            assert!(!marker::is_incomplete(&output));
        }

        #[tokio::test]
        async fn test_spawn_failure_removes_marker() {
            let temp_dir = TempDir::new().unwrap();
            let source = source_in(temp_dir.path(), "clip.mov");
            let output = source.output_path();

            let program = temp_dir.path().join("no-such-ffmpeg");
            let outcome = TranscodeTask::new(source)
                .run(&Supervisor::default(), &settings(program))
                .await;

            assert_eq!(outcome, TaskOutcome::Failed);
            assert!(!output.exists());
            assert!(!marker::is_incomplete(&output));
        }

        async fn run_until_live(
            supervisor: &Arc<Supervisor>,
            source: SourceFile,
            settings: TaskSettings,
        ) -> tokio::task::JoinHandle<TaskOutcome> {
            let task_supervisor = supervisor.clone();
            let handle = tokio::spawn(async move {
                TranscodeTask::new(source)
                    .run(&task_supervisor, &settings)
                    .await
            });
            for _ in 0..200 {
                if supervisor.live_count() == 1 {
                    return handle;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("transcoder never registered");
        }

        #[tokio::test]
        async fn test_cancel_stops_transcoder_and_discards_output() {
            let temp_dir = TempDir::new().unwrap();
            let program = fake_transcoder(
                temp_dir.path(),
                "printf 'partial' > \"$out\"\nexec sleep 30",
            );
            let source = source_in(temp_dir.path(), "clip.mov");
            let output = source.output_path();
            let supervisor = Arc::new(Supervisor::default());

            let handle = run_until_live(&supervisor, source, settings(program)).await;
            let start = Instant::now();
            supervisor.cancel();

            let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();

            assert_eq!(outcome, TaskOutcome::Canceled);
            assert!(start.elapsed() < Duration::from_secs(5));
            assert!(!output.exists());
            assert!(!marker::is_incomplete(&output));
            assert_eq!(supervisor.live_count(), 0);
        }

        #[tokio::test]
        async fn test_cancel_kills_transcoder_ignoring_sigterm() {
            let temp_dir = TempDir::new().unwrap();
            let program = fake_transcoder(
                temp_dir.path(),
                "trap '' TERM\nprintf 'partial' > \"$out\"\nexec sleep 30",
            );
            let source = source_in(temp_dir.path(), "clip.mov");
            let output = source.output_path();
            let supervisor = Arc::new(Supervisor::default());

            let handle = run_until_live(&supervisor, source, settings(program)).await;
            supervisor.cancel();

            let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();

            assert_eq!(outcome, TaskOutcome::Canceled);
            assert!(!output.exists());
            assert!(!marker::is_incomplete(&output));
            assert_eq!(supervisor.live_count(), 0);
        }
    }
}
