// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cross-task execution state: the per-node completion barrier and the
//! build-wide cancellation flag.
//!
//! Every node id maps to either a resolved outcome (completed or failed) or
//! a list of suspended waiters. Completion, failure, and cancellation each
//! transition the map atomically and wake the affected waiters; every waiter
//! is resolved exactly once.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{oneshot, Notify};

/// Sticky cancellation signal shared by every task in a build.
#[derive(Debug, Default)]
pub struct CancellationFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every task suspended in [`cancelled`](Self::cancelled).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag. Only valid between builds.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Resolves once the flag is set. Safe against the set-before-wait race:
    /// the waiter is registered before the flag is re-checked.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

type WaitResult = Result<()>;

#[derive(Default)]
struct StateInner {
    cancelled: bool,
    completed: HashSet<String>,
    failed: HashSet<String>,
    retries: HashMap<String, u32>,
    waiters: HashMap<String, Vec<oneshot::Sender<WaitResult>>>,
}

/// Thread-safe dependency barrier keyed by node id.
#[derive(Default)]
pub struct ExecutionState {
    inner: Mutex<StateInner>,
    operation_count: AtomicU64,
    cache_hits: AtomicU64,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Barrier key for a node. One state instance serves every platform and
    /// stage of a build, so node ids are namespaced by both.
    pub fn scoped_key(
        platform: &crate::platform::Platform,
        stage_id: &str,
        node_id: &str,
    ) -> String {
        format!("{platform}/{stage_id}/{node_id}")
    }

    /// Mark a node completed and wake its waiters with success.
    pub fn mark_node_completed(&self, id: &str) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.completed.insert(id.to_string());
            inner.waiters.remove(id)
        };
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Mark a node failed and reject its waiters with `DependencyFailed`.
    pub fn mark_node_failed(&self, id: &str) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.failed.insert(id.to_string());
            inner.waiters.remove(id)
        };
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(Err(Error::DependencyFailed(id.to_string())));
        }
    }

    /// Wait until `id` resolves. Returns immediately when the node already
    /// completed or failed, or when the state is cancelled.
    pub async fn wait_for_node(&self, id: &str) -> Result<()> {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.completed.contains(id) {
                return Ok(());
            }
            if inner.failed.contains(id) {
                return Err(Error::DependencyFailed(id.to_string()));
            }
            if inner.cancelled {
                return Err(Error::Cancelled);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(id.to_string()).or_default().push(tx);
            rx
        };
        // A dropped sender can only mean the state was torn down mid-wait.
        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Set the cancelled flag and reject every outstanding waiter.
    pub fn cancel(&self) {
        let all_waiters = {
            let mut inner = self.inner.lock();
            inner.cancelled = true;
            std::mem::take(&mut inner.waiters)
        };
        for (_, waiters) in all_waiters {
            for waiter in waiters {
                let _ = waiter.send(Err(Error::Cancelled));
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Clear all state. Must be called before each new build on a reused
    /// scheduler; outstanding waiters (there should be none) are rejected.
    pub fn reset(&self) {
        let stale = {
            let mut inner = self.inner.lock();
            inner.cancelled = false;
            inner.completed.clear();
            inner.failed.clear();
            inner.retries.clear();
            std::mem::take(&mut inner.waiters)
        };
        for (_, waiters) in stale {
            for waiter in waiters {
                let _ = waiter.send(Err(Error::Cancelled));
            }
        }
        self.operation_count.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
    }

    pub fn node_completed(&self, id: &str) -> bool {
        self.inner.lock().completed.contains(id)
    }

    pub fn node_failed(&self, id: &str) -> bool {
        self.inner.lock().failed.contains(id)
    }

    pub fn failed_nodes(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut nodes: Vec<String> = inner.failed.iter().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Record one retry for a node; returns the new count.
    pub fn record_retry(&self, id: &str) -> u32 {
        let mut inner = self.inner.lock();
        let count = inner.retries.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn retry_count(&self, id: &str) -> u32 {
        self.inner.lock().retries.get(id).copied().unwrap_or(0)
    }

    pub fn total_retries(&self) -> u64 {
        self.inner.lock().retries.values().map(|&c| u64::from(c)).sum()
    }

    pub fn increment_operations(&self) {
        self.operation_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_count(&self) -> u64 {
        self.operation_count.load(Ordering::Relaxed)
    }

    pub fn increment_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_immediately_for_completed_node() {
        let state = ExecutionState::new();
        state.mark_node_completed("a");
        state.wait_for_node("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_rejects_for_failed_node() {
        let state = ExecutionState::new();
        state.mark_node_failed("a");
        let err = state.wait_for_node("a").await.unwrap_err();
        assert!(matches!(err, Error::DependencyFailed(id) if id == "a"));
    }

    #[tokio::test]
    async fn test_wait_suspends_until_completion() {
        let state = Arc::new(ExecutionState::new());
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_for_node("slow").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        state.mark_node_completed("slow");
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_rejects_outstanding_waiters() {
        let state = Arc::new(ExecutionState::new());
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_for_node("never").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        state.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        // Sticky: new waits also reject.
        assert!(matches!(
            state.wait_for_node("other").await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let state = ExecutionState::new();
        state.mark_node_completed("a");
        state.mark_node_failed("b");
        state.record_retry("a");
        state.increment_operations();
        state.cancel();

        state.reset();
        assert!(!state.is_cancelled());
        assert!(!state.node_completed("a"));
        assert!(!state.node_failed("b"));
        assert_eq!(state.retry_count("a"), 0);
        assert_eq!(state.operation_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_counters() {
        let state = ExecutionState::new();
        assert_eq!(state.record_retry("n"), 1);
        assert_eq!(state.record_retry("n"), 2);
        assert_eq!(state.retry_count("n"), 2);
        assert_eq!(state.total_retries(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_flag_wakes_waiters() {
        let flag = Arc::new(CancellationFlag::new());
        let waiter = {
            let flag = Arc::clone(&flag);
            tokio::spawn(async move { flag.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        flag.cancel();
        waiter.await.unwrap();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellation_flag_is_idempotent_and_resettable() {
        let flag = CancellationFlag::new();
        flag.cancel();
        flag.cancel();
        assert!(flag.is_cancelled());
        flag.cancelled().await; // resolves immediately
        flag.reset();
        assert!(!flag.is_cancelled());
    }
}
