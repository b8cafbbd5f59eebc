// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Default tunables for the build execution engine.

use std::time::Duration;

/// Resource slots per logical CPU.
pub const DEFAULT_SLOT_MULTIPLIER: usize = 2;

/// Default memory ceiling observed by the resource monitor: 8 GiB.
pub const DEFAULT_MAX_MEMORY_USAGE: u64 = 8 * 1024 * 1024 * 1024;

/// Default interval of the resource monitor's utilization poll.
pub const DEFAULT_MONITORING_INTERVAL: Duration = Duration::from_millis(500);

/// Backstop poll interval for idle work-queue workers. Workers are woken by
/// notification; the poll only covers a lost wakeup between the empty check
/// and the wait registration.
pub const QUEUE_IDLE_POLL: Duration = Duration::from_millis(10);

/// CPU utilization (percent) above which the resource monitor narrows the
/// slot pool.
pub const CPU_PRESSURE_THRESHOLD: f32 = 90.0;

/// CPU utilization (percent) below which the resource monitor widens the
/// slot pool back toward its configured size.
pub const CPU_RELAX_THRESHOLD: f32 = 50.0;

/// Number of trailing output lines carried in failure diagnostics.
pub const DIAGNOSTIC_LOG_TAIL: usize = 5;

/// Number of leading environment entries carried in failure diagnostics.
pub const DIAGNOSTIC_ENV_ENTRIES: usize = 8;

/// Logical CPU count of the host, with a floor of one.
pub fn logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// Default concurrency ceiling: two tasks per logical CPU.
pub fn default_max_concurrency() -> usize {
    DEFAULT_SLOT_MULTIPLIER * logical_cpus()
}
