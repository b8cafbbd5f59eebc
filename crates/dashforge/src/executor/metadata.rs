// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Metadata operations: image config and context mutations.

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::executor::{ExecutionResult, ExecutorCapabilities, OperationExecutor};
use crate::graph::{Environment, MetadataAction, Operation, OperationKind};
use async_trait::async_trait;
use std::time::Instant;

/// Applies metadata actions to the execution context.
///
/// Metadata operations do not change filesystem content: the node's snapshot
/// is the stage's current snapshot. The recorded environment and metadata
/// changes make cache replay possible without re-running the mutation.
#[derive(Debug, Default)]
pub struct MetadataExecutor;

impl MetadataExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OperationExecutor for MetadataExecutor {
    fn name(&self) -> &str {
        "metadata"
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities::for_kind(OperationKind::Metadata)
    }

    async fn execute(
        &self,
        operation: &Operation,
        context: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        let Operation::Metadata(meta) = operation else {
            return Err(Error::Internal(format!(
                "metadata executor received {} operation",
                operation.kind()
            )));
        };
        let started = Instant::now();

        tracing::debug!(operation = %operation.describe(), "applying metadata");
        context.apply_metadata(&meta.action);

        let snapshot = match context.latest_snapshot() {
            Some(snapshot) => snapshot,
            // No base seeded yet (direct executor use); derive a root state.
            None => {
                context
                    .snapshotter()
                    .materialize(None, &operation.content_digest())
                    .await?
            }
        };

        let mut environment_changes = Environment::new();
        if let MetadataAction::Env { key, value } = &meta.action {
            environment_changes.set(key.clone(), value.clone());
        }

        let mut result = ExecutionResult::snapshot_only(snapshot, started.elapsed());
        result.environment_changes = environment_changes;
        result.metadata_changes = vec![meta.action.clone()];
        Ok(result)
    }
}
