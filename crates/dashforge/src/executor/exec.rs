// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Command execution against the stage filesystem.

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::executor::{ExecutionResult, ExecutorCapabilities, OperationExecutor};
use crate::graph::{Command, Environment, Operation, OperationKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Captured output of a completed command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Boundary contract for actually running commands. The in-VM container
/// runtime implements this outside the core; the engine only sees the
/// captured output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &Command,
        environment: &Environment,
        working_directory: Option<&str>,
    ) -> Result<CommandOutput>;
}

/// Runner that succeeds immediately with empty output. Default for builds
/// where no runtime backend is attached.
#[derive(Debug, Default)]
pub struct NullCommandRunner;

#[async_trait]
impl CommandRunner for NullCommandRunner {
    async fn run(
        &self,
        _command: &Command,
        _environment: &Environment,
        _working_directory: Option<&str>,
    ) -> Result<CommandOutput> {
        Ok(CommandOutput::success())
    }
}

/// Executes `RUN` operations through an injected [`CommandRunner`].
pub struct ExecExecutor {
    runner: Arc<dyn CommandRunner>,
}

impl ExecExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl OperationExecutor for ExecExecutor {
    fn name(&self) -> &str {
        "exec"
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
        let Operation::Exec(exec) = operation else {
            return Err(Error::Internal(format!(
                "exec executor received {} operation",
                operation.kind()
            )));
        };
        let started = Instant::now();

        // Effective environment: the context's group-stable environment,
        // then the operation overlay, then the command's own variables.
        let mut environment = context.group_environment();
        environment.merge(&exec.environment);
        environment.merge(&exec.command.environment);

        let working_directory = exec
            .command
            .working_directory
            .clone()
            .or_else(|| context.group_working_directory());

        tracing::debug!(command = %exec.command.display_line(), "running command");
        let output = self
            .runner
            .run(&exec.command, &environment, working_directory.as_deref())
            .await?;

        if !output.is_success() {
            let stderr_tail: Vec<&str> = output
                .stderr
                .lines()
                .rev()
                .take(crate::constants::DIAGNOSTIC_LOG_TAIL)
                .collect();
            return Err(Error::CommandFailed {
                command: exec.command.display_line(),
                status: output.exit_status,
                stderr: stderr_tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
            });
        }

        let snapshot = context
            .snapshotter()
            .materialize(
                context.latest_snapshot().as_ref(),
                &operation.content_digest(),
            )
            .await?;

        let mut result = ExecutionResult::snapshot_only(snapshot, started.elapsed());
        result.output = Some(output);
        Ok(result)
    }
}
