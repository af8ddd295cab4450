//! Per-file progress lines.
//!
//! Every file announces its terminal state on one stdout line tagged by
//! category, e.g. `[SKIP] clip.mov (already converted)`.

use std::fmt;

/// Category of a progress line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Start,
    Skip,
    Done,
    Error,
    Cancel,
    Cleanup,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Start => "START",
            Tag::Skip => "SKIP",
            Tag::Done => "DONE",
            Tag::Error => "ERROR",
            Tag::Cancel => "CANCEL",
            Tag::Cleanup => "CLEANUP",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.as_str())
    }
}

/// Format a progress line without printing it
pub fn line(tag: Tag, message: impl fmt::Display) -> String {
    format!("{} {}", tag, message)
}

/// Print a progress line to stdout
pub fn announce(tag: Tag, message: impl fmt::Display) {
    println!("{}", line(tag, message));
}
