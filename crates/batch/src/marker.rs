//! Incomplete marker module for crash-safe outputs.
//!
//! A `.incomplete` sidecar sits next to an output for as long as the transcode
//! producing it is running. An output without a marker is finished; an output
//! with a marker is a leftover from an interrupted run and gets discarded.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Suffix appended to an output path to form its marker path.
pub const MARKER_SUFFIX: &str = ".incomplete";

/// Constructs the marker path for a given output file.
///
/// For example: `/media/converted/clip.mkv` -> `/media/converted/clip.mkv.incomplete`
pub fn marker_path(output_path: &Path) -> PathBuf {
    let mut marker = output_path.as_os_str().to_owned();
    marker.push(MARKER_SUFFIX);
    PathBuf::from(marker)
}

/// Recovers the output path a marker belongs to.
///
/// Returns None if the path does not carry the marker suffix.
pub fn output_for_marker(marker: &Path) -> Option<PathBuf> {
    let name = marker.file_name()?.to_str()?;
    let output_name = name.strip_suffix(MARKER_SUFFIX)?;
    if output_name.is_empty() {
        return None;
    }
    Some(marker.with_file_name(output_name))
}

/// Checks if a marker exists for the given output file.
pub fn is_incomplete(output_path: &Path) -> bool {
    marker_path(output_path).exists()
}

/// Creates the marker for `output_path`.
///
/// The content is informational only: the creation time and the source being
/// transcoded.
pub fn write_marker(output_path: &Path, source_path: &Path) -> io::Result<()> {
    let mut file = fs::File::create(marker_path(output_path))?;
    writeln!(file, "started: {}", chrono::Local::now().to_rfc3339())?;
    writeln!(file, "source: {}", source_path.display())?;
    file.sync_all()?;
    Ok(())
}

/// Removes the marker for `output_path`. A missing marker is not an error.
pub fn remove_marker(output_path: &Path) -> io::Result<()> {
    remove_if_present(&marker_path(output_path)).map(|_| ())
}

/// Removes a partial output together with its marker.
///
/// Returns true if the output file existed and was removed. Both removals are
/// attempted even if the first one fails; the first error is returned.
pub fn discard_partial(output_path: &Path) -> io::Result<bool> {
    let output_result = remove_if_present(output_path);
    let marker_result = remove_if_present(&marker_path(output_path));
    let removed = output_result?;
    marker_result?;
    Ok(removed)
}

/// Discards the output only if its marker is present.
///
/// Finished outputs (no marker) are never touched. Returns true if anything
/// was discarded.
pub fn discard_if_incomplete(output_path: &Path) -> io::Result<bool> {
    if !is_incomplete(output_path) {
        return Ok(false);
    }
    discard_partial(output_path)?;
    Ok(true)
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Outcome of a crash-recovery sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Markers found and removed.
    pub markers_removed: usize,
    /// Partial outputs removed alongside their markers.
    pub outputs_removed: usize,
    /// Markers or outputs that could not be removed.
    pub errors: usize,
}

/// Removes every leftover marker under `root` and the partial output it guards.
///
/// Walks the whole tree, including `converted` directories where markers live.
/// Failures are logged and counted; the sweep never aborts.
pub fn sweep_incomplete(root: &Path) -> SweepReport {
    let mut report = SweepReport::default();

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(output) = output_for_marker(entry.path()) else {
            continue;
        };

        debug!(marker = %entry.path().display(), "removing leftover marker");
        match discard_partial(&output) {
            Ok(output_removed) => {
                report.markers_removed += 1;
                if output_removed {
                    report.outputs_removed += 1;
                }
            }
            Err(e) => {
                warn!(output = %output.display(), error = %e, "failed to remove incomplete output");
                report.errors += 1;
            }
        }
    }

    report
}
