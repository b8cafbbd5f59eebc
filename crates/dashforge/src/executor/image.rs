// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Base image realization.

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::executor::{ExecutionResult, ExecutorCapabilities, OperationExecutor};
use crate::graph::{Operation, OperationKind};
use async_trait::async_trait;
use std::time::Instant;

/// Realizes a stage's base image into its starting snapshot.
///
/// Registry pulls, OCI layout reads, and tarball unpacking live behind the
/// snapshotter boundary; this executor derives the deterministic identity of
/// the realized state and hands it to dependents.
#[derive(Debug, Default)]
pub struct ImageExecutor;

impl ImageExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OperationExecutor for ImageExecutor {
    fn name(&self) -> &str {
        "image"
    }

    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities::for_kind(OperationKind::Image)
    }

    async fn execute(
        &self,
        operation: &Operation,
        context: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        let Operation::Image(image) = operation else {
            return Err(Error::Internal(format!(
                "image executor received {} operation",
                operation.kind()
            )));
        };
        let started = Instant::now();
        tracing::debug!(source = %image.source, platform = %context.platform(), "realizing base image");

        // Platform participates in the snapshot identity: the same reference
        // resolves to different filesystems per platform.
        let mut digest = crate::digest::DigestWriter::new();
        digest.digest(&operation.content_digest());
        digest.field("platform", &context.platform().to_string());
        let snapshot = context
            .snapshotter()
            .materialize(None, &digest.finish())
            .await?;

        Ok(ExecutionResult::snapshot_only(snapshot, started.elapsed()))
    }
}
