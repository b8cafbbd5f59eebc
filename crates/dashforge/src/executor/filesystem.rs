// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Filesystem operations: copy, add, remove, mkdir, symlink, hardlink.

use crate::context::ExecutionContext;
use crate::digest::{Digest, DigestWriter};
use crate::error::{Error, Result};
use crate::executor::{ExecutionResult, ExecutorCapabilities, FilesystemChange, OperationExecutor};
use crate::graph::{FilesystemAction, FilesystemSource, Operation, OperationKind};
use async_trait::async_trait;
use std::time::Instant;

/// Applies filesystem actions against the stage's current snapshot.
///
/// Content movement is the snapshotter's concern; this executor resolves the
/// source - in particular cross-stage sources, which read another stage's
/// final snapshot out of the shared stage context - and derives the identity
/// of the resulting state.
#[derive(Debug, Default)]
pub struct FilesystemExecutor;

impl FilesystemExecutor {
    pub fn new() -> Self {
        Self
    }

    /// The digest of the operation combined with whatever the source resolves
    /// to right now. A changed source stage must change the result identity
    /// even though the operation itself is unchanged.
    fn effective_digest(
        operation: &Operation,
        source_digest: Option<&Digest>,
    ) -> Digest {
        match source_digest {
            Some(source) => {
                let mut writer = DigestWriter::new();
                writer.digest(&operation.content_digest());
                writer.digest(source);
                writer.finish()
            }
            None => operation.content_digest(),
        }
    }
}

#[async_trait]
impl OperationExecutor for FilesystemExecutor {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities::for_kind(OperationKind::Filesystem)
    }

    async fn execute(
        &self,
        operation: &Operation,
        context: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        let Operation::Filesystem(fs) = operation else {
            return Err(Error::Internal(format!(
                "filesystem executor received {} operation",
                operation.kind()
            )));
        };
        let started = Instant::now();

        // Cross-stage sources read the referenced stage's final snapshot.
        let source_digest = match &fs.source {
            FilesystemSource::Stage { stage, .. } => {
                let rendered = stage.to_string();
                let stage_id = context.resolve_stage_ref(&rendered).ok_or_else(|| {
                    Error::SourceUnavailable(format!("unresolved stage reference '{rendered}'"))
                })?;
                let snapshot = context.stages().final_snapshot(stage_id).ok_or_else(|| {
                    Error::SourceUnavailable(format!(
                        "stage '{stage_id}' has no final snapshot yet"
                    ))
                })?;
                Some(snapshot.digest)
            }
            _ => None,
        };

        tracing::debug!(
            action = fs.action.keyword(),
            destination = %fs.destination,
            "applying filesystem operation"
        );

        let snapshot = context
            .snapshotter()
            .materialize(
                context.latest_snapshot().as_ref(),
                &Self::effective_digest(operation, source_digest.as_ref()),
            )
            .await?;

        let change = match fs.action {
            FilesystemAction::Remove => FilesystemChange::Removed(fs.destination.clone()),
            FilesystemAction::Copy | FilesystemAction::Add => {
                FilesystemChange::Modified(fs.destination.clone())
            }
            FilesystemAction::Mkdir | FilesystemAction::Symlink | FilesystemAction::Hardlink => {
                FilesystemChange::Created(fs.destination.clone())
            }
        };

        let mut result = ExecutionResult::snapshot_only(snapshot, started.elapsed());
        result.filesystem_changes.push(change);
        Ok(result)
    }
}
