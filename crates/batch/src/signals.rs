//! Interrupt handling for av1-batch
//!
//! The first SIGINT/SIGTERM starts the graceful shutdown of a [`Batch`]; a
//! second one kills every live transcoder immediately.

use crate::batch::Batch;
use crate::supervisor::ShutdownReport;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
#[cfg(unix)]
pub async fn wait_for_interrupt() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

/// Wait for Ctrl+C.
#[cfg(not(unix))]
pub async fn wait_for_interrupt() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Spawn the interrupt watcher for `batch`.
///
/// The handle resolves to `Some(report)` once an interrupt was handled and
/// the shutdown (including the sweep of `root`) finished. It never resolves
/// if no interrupt arrives; abort it when the run ends normally.
pub fn spawn_interrupt_handler(batch: Arc<Batch>, root: PathBuf) -> JoinHandle<Option<ShutdownReport>> {
    tokio::spawn(async move {
        if let Err(e) = wait_for_interrupt().await {
            error!(error = %e, "failed to listen for interrupts");
            return None;
        }

        eprintln!("\nInterrupt received, stopping transcoders (interrupt again to force)");

        let shutdown = batch.shutdown(&root);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                report = &mut shutdown => return Some(report),
                result = wait_for_interrupt() => match result {
                    Ok(()) => {
                        let killed = batch.supervisor().force_kill_all();
                        warn!(killed, "repeated interrupt, killing all transcoders");
                    }
                    Err(e) => {
                        error!(error = %e, "failed to listen for interrupts");
                        return Some(shutdown.await);
                    }
                },
            }
        }
    })
}
