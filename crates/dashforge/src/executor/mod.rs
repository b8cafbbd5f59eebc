// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Operation executors and the dispatch contract.
//!
//! The dispatcher holds a set of [`OperationExecutor`] implementations, each
//! declaring [`ExecutorCapabilities`]. `dispatch` selects the first executor
//! that claims the operation, covers the context's platform, and satisfies
//! the node's constraints; if none does, the operation fails with
//! `UnsupportedOperation` - dispatch never silently succeeds.

pub mod exec;
pub mod filesystem;
pub mod image;
pub mod metadata;
pub mod unknown;

pub use exec::{CommandOutput, CommandRunner, ExecExecutor, NullCommandRunner};
pub use filesystem::FilesystemExecutor;
pub use image::ImageExecutor;
pub use metadata::MetadataExecutor;
pub use unknown::UnknownExecutor;

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::graph::{Environment, MetadataAction, NodeConstraints, Operation, OperationKind};
use crate::platform::Platform;
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// A filesystem mutation performed by an executor, for diagnostics and
/// (out-of-scope) diff consumers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemChange {
    Created(String),
    Modified(String),
    Removed(String),
}

/// The complete outcome of one operation execution.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub filesystem_changes: Vec<FilesystemChange>,
    pub environment_changes: Environment,
    pub metadata_changes: Vec<MetadataAction>,
    pub snapshot: Snapshot,
    pub duration: Duration,
    pub output: Option<CommandOutput>,
}

impl ExecutionResult {
    /// A result with only a snapshot and duration.
    pub fn snapshot_only(snapshot: Snapshot, duration: Duration) -> Self {
        Self {
            filesystem_changes: Vec::new(),
            environment_changes: Environment::new(),
            metadata_changes: Vec::new(),
            snapshot,
            duration,
            output: None,
        }
    }
}

/// What an executor can do, checked during dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorCapabilities {
    pub supported_operations: BTreeSet<OperationKind>,
    /// `None` means platform-agnostic.
    pub supported_platforms: Option<Vec<Platform>>,
    /// Whether the executor runs operations with privileges.
    pub privileged: bool,
    pub max_concurrency: usize,
    /// Memory available to a single operation, in bytes.
    pub memory: u64,
}

impl Default for ExecutorCapabilities {
    fn default() -> Self {
        Self {
            supported_operations: BTreeSet::new(),
            supported_platforms: None,
            privileged: false,
            max_concurrency: crate::constants::default_max_concurrency(),
            memory: crate::constants::DEFAULT_MAX_MEMORY_USAGE,
        }
    }
}

impl ExecutorCapabilities {
    pub fn for_kind(kind: OperationKind) -> Self {
        Self {
            supported_operations: BTreeSet::from([kind]),
            ..Self::default()
        }
    }

    pub fn supports_platform(&self, platform: &Platform) -> bool {
        match &self.supported_platforms {
            None => true,
            Some(platforms) => platforms.iter().any(|p| platform.satisfies(p) || p == platform),
        }
    }

    /// Whether the executor satisfies a node's constraints on `platform`.
    pub fn satisfies(&self, constraints: &NodeConstraints, platform: &Platform) -> bool {
        if constraints.requires_privileged && !self.privileged {
            return false;
        }
        if let Some(limit) = constraints.memory_limit {
            if self.memory < limit {
                return false;
            }
        }
        if let Some(required) = &constraints.requires_platform {
            if !platform.satisfies(required) || !self.supports_platform(required) {
                return false;
            }
        }
        true
    }
}

/// One operation-kind executor. Implementations either return a complete
/// [`ExecutionResult`] or fail with a typed error; the scheduler wraps
/// failures as `OperationFailed`.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ExecutorCapabilities;

    fn can_execute(&self, operation: &Operation) -> bool {
        self.capabilities()
            .supported_operations
            .contains(&operation.kind())
    }

    async fn execute(
        &self,
        operation: &Operation,
        context: &ExecutionContext,
    ) -> Result<ExecutionResult>;
}

/// Routes operations to the first capable executor.
pub struct ExecutionDispatcher {
    executors: Vec<Arc<dyn OperationExecutor>>,
}

impl ExecutionDispatcher {
    pub fn new(executors: Vec<Arc<dyn OperationExecutor>>) -> Self {
        Self { executors }
    }

    /// The standard executor set: image, exec (with the given runner),
    /// filesystem, metadata, and the refusing unknown executor.
    pub fn standard(runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(vec![
            Arc::new(ImageExecutor::new()),
            Arc::new(ExecExecutor::new(runner)),
            Arc::new(FilesystemExecutor::new()),
            Arc::new(MetadataExecutor::new()),
            Arc::new(UnknownExecutor::new()),
        ])
    }

    /// The first executor that claims `operation`, covers `platform`, and
    /// satisfies `constraints`.
    pub fn select(
        &self,
        operation: &Operation,
        platform: &Platform,
        constraints: Option<&NodeConstraints>,
    ) -> Option<&Arc<dyn OperationExecutor>> {
        self.executors.iter().find(|executor| {
            if !executor.can_execute(operation) {
                return false;
            }
            let capabilities = executor.capabilities();
            if !capabilities.supports_platform(platform) {
                return false;
            }
            match constraints {
                Some(constraints) => capabilities.satisfies(constraints, platform),
                None => true,
            }
        })
    }

    /// Dispatch `operation` through the selected executor.
    pub async fn dispatch(
        &self,
        operation: &Operation,
        context: &ExecutionContext,
        constraints: Option<&NodeConstraints>,
    ) -> Result<ExecutionResult> {
        let executor = self
            .select(operation, context.platform(), constraints)
            .ok_or_else(|| Error::UnsupportedOperation(operation.describe()))?;
        tracing::debug!(
            executor = executor.name(),
            operation = %operation.describe(),
            platform = %context.platform(),
            "dispatching operation"
        );
        executor.execute(operation, context).await
    }
}
