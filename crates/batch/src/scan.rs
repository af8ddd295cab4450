//! Scanner module for discovering source videos under a root directory.
//!
//! Walks the tree recursively, selecting files by extension and pruning the
//! `converted` output directories so earlier results are never re-processed.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Name of the output subdirectory created next to every source file.
pub const CONVERTED_DIR: &str = "converted";

/// Extension of every transcoded output file (without the dot).
pub const OUTPUT_EXTENSION: &str = "mkv";

/// A source video discovered during scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Full path to the source video.
    pub path: PathBuf,
    /// Directory containing the source video.
    pub dir: PathBuf,
    /// File name of the source video, for display.
    pub file_name: String,
}

impl SourceFile {
    /// Build a descriptor from a file path. Returns None for paths without a
    /// parent directory or file name.
    pub fn new(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let dir = path.parent()?.to_path_buf();
        let file_name = path.file_name()?.to_string_lossy().into_owned();
        Some(Self {
            path,
            dir,
            file_name,
        })
    }

    /// Directory receiving this file's output: `<dir>/converted`.
    pub fn converted_dir(&self) -> PathBuf {
        self.dir.join(CONVERTED_DIR)
    }

    /// Deterministic output path: `<dir>/converted/<stem>.mkv`.
    ///
    /// For example: `/media/clip.MOV` -> `/media/converted/clip.mkv`
    pub fn output_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .unwrap_or_else(|| OsStr::new(&self.file_name));
        let mut name = stem.to_os_string();
        name.push(".");
        name.push(OUTPUT_EXTENSION);
        self.converted_dir().join(name)
    }
}

/// Normalizes a configured extension to lowercase without the leading dot.
fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

/// Checks if a file's extension is in the allow-set (case-insensitive).
///
/// Extensions may be given with or without the leading dot.
pub fn has_source_extension<S: AsRef<str>>(path: &Path, extensions: &[S]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = ext.to_lowercase();
            extensions
                .iter()
                .any(|allowed| normalize_extension(allowed.as_ref()) == ext_lower)
        })
        .unwrap_or(false)
}

/// Checks if a walk entry is an output directory that must not be descended.
fn is_converted_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_type().is_dir() && entry.file_name() == CONVERTED_DIR
}

/// Enumerates source videos under `root`.
///
/// This function:
/// - Recursively walks the root in directory-tree order (no sorting)
/// - Prunes every directory named `converted`
/// - Selects regular files whose extension is in `extensions` (case-insensitive)
/// - Logs and skips entries that cannot be read
///
/// An empty vector is returned when nothing matches.
pub fn enumerate_sources<S: AsRef<str>>(root: &Path, extensions: &[S]) -> Vec<SourceFile> {
    let mut sources = Vec::new();

    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| !is_converted_dir(entry));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if !has_source_extension(path, extensions) {
            continue;
        }

        match SourceFile::new(path) {
            Some(source) => {
                debug!(path = %path.display(), "queueing source file");
                sources.push(source);
            }
            None => warn!(path = %path.display(), "skipping path without a file name"),
        }
    }

    sources
}
