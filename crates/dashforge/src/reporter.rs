// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Build progress events.
//!
//! The [`Reporter`] is a single-producer, multi-consumer event stream: every
//! task in a build emits through a clone of the same handle, and any number
//! of consumers subscribe to receive events in emission order. Emission is
//! synchronous (unbounded channels), so once `execute` returns, every event
//! is already queued at each consumer.
//!
//! Per-node ordering contract: `Started` is followed by exactly one of
//! `CacheHit`, `Finished`, or `Failed`, with any number of `Log` events
//! before `Finished`/`Failed`.

use crate::graph::SourceLocation;
use crate::platform::Platform;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifies the operation an event refers to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportContext {
    pub node_id: String,
    pub stage_id: String,
    /// Single-line rendering of the operation (`RUN …`, `COPY src dst`, …).
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_location: Option<SourceLocation>,
}

impl ReportContext {
    pub fn new(
        node_id: impl Into<String>,
        stage_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            stage_id: stage_id.into(),
            description: description.into(),
            timestamp: Utc::now(),
            source_location: None,
        }
    }

    #[must_use]
    pub fn with_source_location(mut self, location: SourceLocation) -> Self {
        self.source_location = Some(location);
        self
    }
}

/// One build progress event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BuildEvent {
    BuildStarted {
        total_operations: usize,
        stages: usize,
        timestamp: DateTime<Utc>,
    },
    StageStarted {
        stage: String,
        platform: Platform,
        timestamp: DateTime<Utc>,
    },
    StageCompleted {
        stage: String,
        platform: Platform,
        timestamp: DateTime<Utc>,
    },
    OperationStarted {
        context: ReportContext,
    },
    OperationCacheHit {
        context: ReportContext,
    },
    OperationLog {
        context: ReportContext,
        message: String,
    },
    OperationFinished {
        context: ReportContext,
        duration: Duration,
    },
    OperationFailed {
        context: ReportContext,
        error: String,
        /// Diagnostic key-value pairs: working directory, leading environment
        /// entries, trailing output lines.
        diagnostics: BTreeMap<String, String>,
    },
    BuildCompleted {
        success: bool,
        timestamp: DateTime<Utc>,
    },
}

impl BuildEvent {
    /// The node this event refers to, when it is operation-scoped.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            BuildEvent::OperationStarted { context }
            | BuildEvent::OperationCacheHit { context }
            | BuildEvent::OperationLog { context, .. }
            | BuildEvent::OperationFinished { context, .. }
            | BuildEvent::OperationFailed { context, .. } => Some(&context.node_id),
            _ => None,
        }
    }

    /// Whether this event ends a node's event sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildEvent::OperationCacheHit { .. }
                | BuildEvent::OperationFinished { .. }
                | BuildEvent::OperationFailed { .. }
        )
    }
}

#[derive(Default)]
struct ReporterInner {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BuildEvent>>>,
}

/// Clonable handle to the build event stream.
#[derive(Clone, Default)]
pub struct Reporter {
    inner: Arc<ReporterInner>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer. Events emitted after this call are delivered in
    /// emission order; the receiver ends when [`finish`](Self::finish) runs.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BuildEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Emit an event to all subscribers. Closed subscribers are dropped.
    pub fn emit(&self, event: BuildEvent) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Close the stream: all subscriber channels end once drained.
    pub fn finish(&self) {
        self.inner.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Collects every event into memory. Intended for tests and result logs.
pub struct EventCollector {
    events: Arc<Mutex<Vec<BuildEvent>>>,
    task: tokio::task::JoinHandle<()>,
}

impl EventCollector {
    /// Subscribe to `reporter` and start collecting in a background task.
    pub fn attach(reporter: &Reporter) -> Self {
        let mut rx = reporter.subscribe();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.lock().push(event);
            }
        });
        Self { events, task }
    }

    /// Snapshot of the events collected so far.
    pub fn snapshot(&self) -> Vec<BuildEvent> {
        self.events.lock().clone()
    }

    /// Wait for the stream to end (after `Reporter::finish`) and return all
    /// collected events.
    pub async fn drain(self) -> Vec<BuildEvent> {
        let _ = self.task.await;
        Arc::try_unwrap(self.events)
            .map(|m| m.into_inner())
            .unwrap_or_default()
    }
}

/// Forward events to `tracing` logs. Returns the consumer task handle; the
/// task ends when the reporter finishes.
pub fn spawn_logging_consumer(reporter: &Reporter) -> tokio::task::JoinHandle<()> {
    let mut rx = reporter.subscribe();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match &event {
                BuildEvent::OperationFailed { context, error, .. } => {
                    tracing::error!(node = %context.node_id, %error, "operation failed");
                }
                BuildEvent::OperationFinished { context, duration } => {
                    tracing::info!(node = %context.node_id, ?duration, "operation finished");
                }
                BuildEvent::OperationCacheHit { context } => {
                    tracing::info!(node = %context.node_id, "cache hit");
                }
                BuildEvent::OperationLog { context, message } => {
                    tracing::debug!(node = %context.node_id, "{message}");
                }
                other => tracing::debug!(?other, "build event"),
            }
        }
    })
}
