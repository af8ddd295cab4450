//! CLI entry point for av1-batch
//!
//! Parses command line arguments, layers them over the configuration file and
//! environment, runs one batch and maps the result to an exit code.

use av1_batch::config::ConfigError;
use av1_batch::{spawn_interrupt_handler, Batch, BatchError, Config, RunSummary};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Exit code of a run stopped by SIGINT/SIGTERM
const EXIT_CANCELED: u8 = 130;

/// Exit code of a startup failure
const EXIT_STARTUP: u8 = 1;

/// av1-batch - Convert a directory tree of videos to AV1/MKV
#[derive(Parser, Debug)]
#[command(name = "av1-batch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory to scan recursively for source videos
    root: PathBuf,

    /// Path to an optional configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of concurrent transcodes
    #[arg(short, long)]
    workers: Option<u32>,

    /// Transcoder threads per worker (derived from the CPU budget by default)
    #[arg(short, long)]
    threads: Option<u32>,

    /// Target CPU utilization in percent
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=100))]
    cpu_percent: Option<u32>,

    /// Transcoder program
    #[arg(long)]
    ffmpeg: Option<String>,

    /// Skip the transcoder availability check. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Config file, then environment, then command line
fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = Config::load_or_default(args.config.as_ref())?;

    if let Some(workers) = args.workers {
        config.workers.max_workers = workers;
    }
    if let Some(threads) = args.threads {
        config.workers.threads_per_worker = threads;
    }
    if let Some(percent) = args.cpu_percent {
        config.cpu.target_cpu_percent = percent;
    }
    if let Some(program) = &args.ffmpeg {
        config.encoder.program = program.clone();
    }

    Ok(config)
}

/// Exit code for the result of a run
fn exit_status(result: &Result<RunSummary, BatchError>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(BatchError::Canceled(_)) => EXIT_CANCELED,
        Err(BatchError::Config(_) | BatchError::Startup(_)) => EXIT_STARTUP,
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", BatchError::from(e));
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let batch = if args.skip_checks {
        warn!("skipping transcoder check (--skip-checks enabled)");
        Batch::new_without_checks(config)
    } else {
        match Batch::new(config) {
            Ok(batch) => batch,
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::from(EXIT_STARTUP);
            }
        }
    };

    let batch = Arc::new(batch);
    let interrupt = spawn_interrupt_handler(batch.clone(), args.root.clone());

    let result = batch.run(&args.root).await;
    match &result {
        Ok(_) => interrupt.abort(),
        Err(BatchError::Canceled(_)) => {
            // The handler finishes the sweep before the process exits
            match interrupt.await {
                Ok(Some(report)) => debug!(?report, "interrupt handled"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "interrupt handler failed"),
            }
            eprintln!("Interrupted");
        }
        Err(e) => {
            interrupt.abort();
            eprintln!("Error: {}", e);
        }
    }

    ExitCode::from(exit_status(&result))
}
