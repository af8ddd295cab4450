//! av1-batch
//!
//! Batch transcoder that converts every source video under a directory tree to
//! AV1/MKV in a `converted` subdirectory next to the source, with a bounded
//! worker pool, crash-safe outputs and graceful interrupt handling.

pub mod batch;
pub mod concurrency;
pub mod encode;
pub mod marker;
pub mod report;
pub mod scan;
pub mod scheduler;
pub mod signals;
pub mod startup;
pub mod supervisor;
pub mod task;

pub use av1_batch_config as config;
pub use av1_batch_config::Config;
pub use batch::{Batch, BatchError};
pub use concurrency::{derive_plan, threads_per_worker, ConcurrencyPlan};
pub use encode::{build_ffmpeg_command, spawn_transcoder, EncodeParams};
pub use marker::{sweep_incomplete, SweepReport};
pub use scan::{enumerate_sources, SourceFile};
pub use scheduler::{Canceled, RunSummary, Scheduler};
pub use signals::{spawn_interrupt_handler, wait_for_interrupt};
pub use startup::{check_transcoder_available, parse_ffmpeg_version, validate_root, StartupError};
pub use supervisor::{ShutdownReport, StopSignal, Supervisor};
pub use task::{TaskError, TaskOutcome, TaskSettings, TaskState, TranscodeTask};
