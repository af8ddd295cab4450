//! Concurrency planning module for av1-batch
//!
//! Derives the worker pool size and per-transcoder thread budget from the CPU
//! core count and a target utilization percentage.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Target utilization in percent, clamped to 1..=100
    pub target_percent: u32,
    /// Threads the whole batch may keep busy
    pub target_threads: u32,
    /// Maximum number of transcodes running at once
    pub max_workers: u32,
    /// Threads handed to each transcoder process
    pub threads_per_worker: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Clamps target_cpu_percent to [1, 100]
    /// - Floors max_workers at 1
    /// - Uses an explicit non-zero threads_per_worker unchanged, otherwise derives it
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let target_percent = clamp_percent(cfg.cpu.target_cpu_percent);
        let max_workers = cfg.workers.max_workers.max(1);

        let threads_per_worker = if cfg.workers.threads_per_worker > 0 {
            cfg.workers.threads_per_worker
        } else {
            threads_per_worker(total_cores, target_percent, max_workers)
        };

        Self {
            total_cores,
            target_percent,
            target_threads: target_threads(total_cores, target_percent),
            max_workers,
            threads_per_worker,
        }
    }
}

/// Threads the whole batch may use: `floor(percent * cores / 100)`, at least 1.
pub fn target_threads(cpu_count: u32, target_percent: u32) -> u32 {
    let total = (u64::from(target_percent) * u64::from(cpu_count)) / 100;
    (total as u32).max(1)
}

/// Threads each worker's transcoder may use.
///
/// `max(1, floor(target_threads / max_workers))`, where `target_threads` is
/// itself floored at 1, so the result is never zero.
pub fn threads_per_worker(cpu_count: u32, target_percent: u32, max_workers: u32) -> u32 {
    let total = target_threads(cpu_count, target_percent);
    (total / max_workers.max(1)).max(1)
}

/// Clamp a utilization percentage to [1, 100]
fn clamp_percent(percent: u32) -> u32 {
    percent.clamp(1, 100)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
