//! Encoding modules for av1-batch

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_command, spawn_transcoder, EncodeParams};
