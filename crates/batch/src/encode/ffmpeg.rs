//! FFmpeg invocation module for av1-batch
//!
//! Builds and spawns the transcoder process with fixed SVT-AV1/AAC settings,
//! an explicit thread limit and lowered scheduling priority.

use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Fixed SVT-AV1 quality settings
const VIDEO_CODEC: &str = "libsvtav1";
const VIDEO_CRF: &str = "35";
const VIDEO_PRESET: &str = "8";

/// Fixed audio settings
const AUDIO_CODEC: &str = "aac";
const AUDIO_BITRATE: &str = "128k";

/// Parameters for one transcoder invocation
#[derive(Debug, Clone)]
pub struct EncodeParams {
    /// Transcoder program name or path
    pub program: PathBuf,
    /// Path to the source video
    pub input_path: PathBuf,
    /// Final output path
    pub output_path: PathBuf,
    /// Thread limit passed to the transcoder and its encoder
    pub threads: u32,
    /// Niceness for the child process (0 leaves priority unchanged)
    pub nice_level: i32,
}

impl EncodeParams {
    /// Create new encoding parameters
    pub fn new(
        program: impl Into<PathBuf>,
        input_path: PathBuf,
        output_path: PathBuf,
        threads: u32,
        nice_level: i32,
    ) -> Self {
        Self {
            program: program.into(),
            input_path,
            output_path,
            threads,
            nice_level,
        }
    }
}

/// Build an ffmpeg command with all required encoding flags
///
/// Creates a Command configured with:
/// - Input and output paths
/// - `-threads` and the SVT-AV1 `lp` parameter set to the thread budget
/// - Fixed video (libsvtav1, CRF 35, preset 8) and audio (AAC 128k) settings
/// - `-n` so an existing output is never overwritten
/// - Inherited stdout/stderr, null stdin
/// - On unix: its own process group and the configured niceness
pub fn build_ffmpeg_command(params: &EncodeParams) -> Command {
    let mut cmd = Command::new(&params.program);
    let threads = params.threads.max(1).to_string();

    cmd.args(["-hide_banner", "-nostdin", "-n"]);
    cmd.arg("-i").arg(&params.input_path);
    cmd.arg("-threads").arg(&threads);

    #[rustfmt::skip]
    cmd.args([
        "-c:v", VIDEO_CODEC,
        "-crf", VIDEO_CRF,
        "-preset", VIDEO_PRESET,
    ]);
    cmd.arg("-svtav1-params").arg(format!("lp={}", threads));

    #[rustfmt::skip]
    cmd.args([
        "-c:a", AUDIO_CODEC,
        "-b:a", AUDIO_BITRATE,
    ]);

    cmd.arg(&params.output_path);

    cmd.stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    #[cfg(unix)]
    {
        // Keep terminal Ctrl+C away from the child; the supervisor decides when it stops.
        cmd.process_group(0);
        lower_priority(&mut cmd, params.nice_level);
    }

    cmd
}

#[cfg(unix)]
fn lower_priority(cmd: &mut Command, nice_level: i32) {
    if nice_level <= 0 {
        return;
    }
    let level = nice_level.min(19);
    // SAFETY: setpriority is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(move || {
            // Best effort: a failure leaves the child at normal priority.
            libc::setpriority(libc::PRIO_PROCESS, 0, level);
            Ok(())
        });
    }
}

/// Spawn the transcoder for `params`.
///
/// The caller owns the returned child and must wait on it.
pub fn spawn_transcoder(params: &EncodeParams) -> std::io::Result<Child> {
    build_ffmpeg_command(params).spawn()
}
