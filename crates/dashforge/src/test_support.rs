// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Shared test fixtures: scripted executors, a scripted command runner, and
//! event assertions.

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::executor::{
    CommandOutput, CommandRunner, ExecutionResult, ExecutorCapabilities, OperationExecutor,
};
use crate::graph::{Command, Environment, Operation, OperationKind};
use crate::reporter::BuildEvent;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Exec-kind executor whose behavior is scripted per operation description:
/// fail N times before succeeding, or sleep for a fixed duration. Counts
/// every dispatch so tests can assert on executor traffic.
#[derive(Default)]
pub struct ScriptedExecutor {
    dispatches: AtomicU64,
    dispatches_by_description: DashMap<String, u64>,
    remaining_failures: DashMap<String, u32>,
    delays: DashMap<String, Duration>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` dispatches of the operation described by
    /// `description` fail with a retryable error.
    pub fn fail_times(&self, description: impl Into<String>, count: u32) {
        self.remaining_failures.insert(description.into(), count);
    }

    /// Dispatches of `description` sleep for `delay` before succeeding.
    pub fn delay(&self, description: impl Into<String>, delay: Duration) {
        self.delays.insert(description.into(), delay);
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    pub fn dispatches_for(&self, description: &str) -> u64 {
        self.dispatches_by_description
            .get(description)
            .map(|c| *c)
            .unwrap_or(0)
    }
}

#[async_trait]
impl OperationExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities {
            privileged: true,
            ..ExecutorCapabilities::for_kind(OperationKind::Exec)
        }
    }

    async fn execute(
        &self,
        operation: &Operation,
        context: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let description = operation.describe();
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        *self
            .dispatches_by_description
            .entry(description.clone())
            .or_insert(0) += 1;

        if let Some(delay) = self.delays.get(&description).map(|d| *d) {
            tokio::time::sleep(delay).await;
        }
        if let Some(mut remaining) = self.remaining_failures.get_mut(&description) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Execution(format!("scripted failure: {description}")));
            }
        }

        let snapshot = context
            .snapshotter()
            .materialize(
                context.latest_snapshot().as_ref(),
                &operation.content_digest(),
            )
            .await?;
        Ok(ExecutionResult::snapshot_only(snapshot, started.elapsed()))
    }
}

/// [`CommandRunner`] double scripted per command line: a scripted entry
/// fixes the output and exit status returned for that command, anything
/// unscripted succeeds with empty output. Counts every invocation so tests
/// can assert on runner-boundary traffic.
#[derive(Default)]
pub struct ScriptedCommandRunner {
    invocations: AtomicU64,
    outputs: DashMap<String, CommandOutput>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the full output for the command rendered as `command_line`.
    pub fn respond(&self, command_line: impl Into<String>, output: CommandOutput) {
        self.outputs.insert(command_line.into(), output);
    }

    /// Script a non-zero exit with the given stderr for `command_line`.
    pub fn fail_with(&self, command_line: impl Into<String>, status: i32, stderr: &str) {
        self.respond(
            command_line,
            CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_status: status,
            },
        );
    }

    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn run(
        &self,
        command: &Command,
        _environment: &Environment,
        _working_directory: Option<&str>,
    ) -> Result<CommandOutput> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .outputs
            .get(&command.display_line())
            .map(|output| output.clone())
            .unwrap_or_else(CommandOutput::success))
    }
}

/// Names of events in emission order, for order assertions.
pub fn event_names(events: &[BuildEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|event| match event {
            BuildEvent::BuildStarted { .. } => "build_started",
            BuildEvent::StageStarted { .. } => "stage_started",
            BuildEvent::StageCompleted { .. } => "stage_completed",
            BuildEvent::OperationStarted { .. } => "operation_started",
            BuildEvent::OperationCacheHit { .. } => "operation_cache_hit",
            BuildEvent::OperationLog { .. } => "operation_log",
            BuildEvent::OperationFinished { .. } => "operation_finished",
            BuildEvent::OperationFailed { .. } => "operation_failed",
            BuildEvent::BuildCompleted { .. } => "build_completed",
        })
        .collect()
}

/// Count of `OperationStarted` events for a node.
pub fn started_count(events: &[BuildEvent], node_id: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, BuildEvent::OperationStarted { .. }) && e.node_id() == Some(node_id))
        .count()
}

/// Count of terminal events (cache hit, finished, failed) for a node.
pub fn terminal_count(events: &[BuildEvent], node_id: &str) -> usize {
    events
        .iter()
        .filter(|e| e.is_terminal() && e.node_id() == Some(node_id))
        .count()
}

/// Index of a node's first `OperationStarted` event.
pub fn started_index(events: &[BuildEvent], node_id: &str) -> Option<usize> {
    events.iter().position(|e| {
        matches!(e, BuildEvent::OperationStarted { .. }) && e.node_id() == Some(node_id)
    })
}

/// Index of a node's terminal event.
pub fn terminal_index(events: &[BuildEvent], node_id: &str) -> Option<usize> {
    events
        .iter()
        .position(|e| e.is_terminal() && e.node_id() == Some(node_id))
}
