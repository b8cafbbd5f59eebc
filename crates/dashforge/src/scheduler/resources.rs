// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Resource slot accounting with adaptive capacity.
//!
//! The monitor hands out integer execution slots (default two per logical
//! CPU). Waiters queue FIFO so a wide request cannot be starved by a stream
//! of narrow ones. A background task polls system utilization and may narrow
//! or widen the pool, but the pool never drops below one slot, so a runnable
//! node can always make progress.

use crate::constants::{CPU_PRESSURE_THRESHOLD, CPU_RELAX_THRESHOLD};
use crate::error::{Error, Result};
use crate::scheduler::state::CancellationFlag;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

struct MonitorInner {
    available: usize,
    waiters: VecDeque<(usize, oneshot::Sender<Result<()>>)>,
}

/// Slot-based throttle shared by every group execution in a build.
pub struct ResourceMonitor {
    inner: Mutex<MonitorInner>,
    /// Current pool size; adapted by the utilization poll.
    capacity: AtomicUsize,
    /// Pool size configured at construction; the upper bound for widening.
    configured: usize,
    shutdown: AtomicBool,
}

impl ResourceMonitor {
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            inner: Mutex::new(MonitorInner {
                available: slots,
                waiters: VecDeque::new(),
            }),
            capacity: AtomicUsize::new(slots),
            configured: slots,
            shutdown: AtomicBool::new(false),
        }
    }

    /// The current pool size.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.inner.lock().available
    }

    /// Acquire `count` slots, suspending until they are available. Requests
    /// are served FIFO. Rejected with `Cancelled` after [`shutdown`](Self::shutdown).
    pub async fn wait_for_resources(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let rx = {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            let mut inner = self.inner.lock();
            if inner.waiters.is_empty() && inner.available >= count {
                inner.available -= count;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back((count, tx));
            rx
        };
        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Return one slot and wake satisfiable waiters from the queue head.
    pub fn release_resource(&self) {
        self.release_many(1);
    }

    pub fn release_many(&self, count: usize) {
        let granted = {
            let mut inner = self.inner.lock();
            inner.available = (inner.available + count).min(self.capacity());
            Self::grant_waiters(&mut inner)
        };
        for waiter in granted {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Pop waiters off the head while their requests fit.
    fn grant_waiters(inner: &mut MonitorInner) -> Vec<oneshot::Sender<Result<()>>> {
        let mut granted = Vec::new();
        while let Some((count, _)) = inner.waiters.front() {
            if inner.available < *count {
                break;
            }
            let count = *count;
            if let Some((_, tx)) = inner.waiters.pop_front() {
                inner.available -= count;
                granted.push(tx);
            }
        }
        granted
    }

    /// Resize the pool. Widening frees slots immediately; narrowing only
    /// reduces idle slots, never below a floor of one total.
    pub fn adjust_capacity(&self, new_capacity: usize) {
        let new_capacity = new_capacity.clamp(1, self.configured);
        let old_capacity = self.capacity.swap(new_capacity, Ordering::SeqCst);
        let granted = {
            let mut inner = self.inner.lock();
            if new_capacity > old_capacity {
                inner.available += new_capacity - old_capacity;
            } else {
                let shrink = old_capacity - new_capacity;
                inner.available = inner.available.saturating_sub(shrink);
            }
            Self::grant_waiters(&mut inner)
        };
        for waiter in granted {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Reject all waiters and refuse new requests.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let rejected: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.waiters.drain(..).collect()
        };
        for (_, waiter) in rejected {
            let _ = waiter.send(Err(Error::Cancelled));
        }
    }

    /// Re-arm after a shutdown. Only valid between builds.
    pub fn reset(&self) {
        self.shutdown.store(false, Ordering::SeqCst);
        self.capacity.store(self.configured, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.available = self.configured;
        inner.waiters.clear();
    }

    /// Background utilization poll: narrows the pool under CPU or memory
    /// pressure, widens it back toward the configured size when pressure
    /// clears. Ends when `flag` is cancelled.
    pub fn spawn_utilization_poll(
        monitor: &Arc<Self>,
        interval: Duration,
        max_memory_usage: u64,
        flag: Arc<CancellationFlag>,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(monitor);
        tokio::spawn(async move {
            let mut system = sysinfo::System::new();
            loop {
                tokio::select! {
                    _ = flag.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                system.refresh_cpu_usage();
                system.refresh_memory();
                let cpu = system.global_cpu_usage();
                let memory = system.used_memory();

                let capacity = monitor.capacity();
                if cpu > CPU_PRESSURE_THRESHOLD || memory > max_memory_usage {
                    if capacity > 1 {
                        tracing::debug!(cpu, memory, capacity, "narrowing resource pool");
                        monitor.adjust_capacity(capacity - 1);
                    }
                } else if cpu < CPU_RELAX_THRESHOLD && capacity < monitor.configured {
                    monitor.adjust_capacity(capacity + 1);
                }
            }
        })
    }
}
