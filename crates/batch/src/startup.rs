//! Startup checks module for av1-batch
//!
//! Preflight checks run before any file is touched:
//! - Root directory validation
//! - Transcoder availability (`<program> -version`), with the major version
//!   extracted for the log

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("transcoder not available: {0}")]
    TranscoderUnavailable(String),

    #[error("invalid root directory {path}: {reason}")]
    InvalidRoot { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Check that the root exists and is a directory.
///
/// Returns the canonical form of `root` so every path derived from it is
/// absolute.
pub fn validate_root(root: &Path) -> Result<PathBuf, StartupError> {
    let metadata = std::fs::metadata(root).map_err(|e| StartupError::InvalidRoot {
        path: root.to_path_buf(),
        reason: e.to_string(),
    })?;

    if !metadata.is_dir() {
        return Err(StartupError::InvalidRoot {
            path: root.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    Ok(root.canonicalize()?)
}

/// Check that the transcoder runs by invoking `<program> -version`.
///
/// # Returns
/// * `Ok(Some(major))` - The program ran and reported an ffmpeg version
/// * `Ok(None)` - The program ran but its version could not be parsed
/// * `Err(StartupError::TranscoderUnavailable)` - The program is missing or failed
pub fn check_transcoder_available(program: &Path) -> Result<Option<u32>, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::TranscoderUnavailable(format!(
                "{} -version failed; is ffmpeg installed and in PATH? Error: {}",
                program.display(),
                e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::TranscoderUnavailable(format!(
            "{} -version exited with {}",
            program.display(),
            output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    Ok(parse_ffmpeg_version(&version_output))
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 8.0 ..."
/// - N-prefixed: "ffmpeg version n8.0-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    // Git builds report e.g. "n8.0-5-g1234567"
    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}
