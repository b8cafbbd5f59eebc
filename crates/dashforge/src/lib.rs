// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! DashForge - parallel multi-platform container image build engine.
//!
//! DashForge takes an immutable multi-stage [`BuildGraph`] and executes it
//! concurrently across target platforms: base images resolve in parallel,
//! stages start as their `COPY --from` dependencies complete, and nodes
//! inside a stage run in Kahn layers gated by a per-node completion barrier.
//! Execution is content-cached, retried per operation policy, throttled by a
//! resource monitor, and reported as an ordered event stream.
//!
//! The engine owns scheduling only. Registry I/O, filesystem diffing, and
//! command execution live behind the [`Snapshotter`], [`BuildCache`], and
//! [`CommandRunner`] boundaries.
//!
//! # Example
//!
//! ```rust,no_run
//! use dashforge::{
//!     BuildGraph, BuildNode, BuildStage, ExecutionDispatcher, MemoryCache,
//!     MemorySnapshotter, NullCommandRunner, Operation, Platform, Reporter,
//!     Scheduler, SchedulerConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> dashforge::Result<()> {
//! let graph = BuildGraph::new()
//!     .with_platform(Platform::linux_arm64())
//!     .with_stage(
//!         BuildStage::new("app", Operation::from_registry("alpine:3.20"))
//!             .with_node(BuildNode::new("env", Operation::env("MODE", "release")))
//!             .with_node(
//!                 BuildNode::new("copy", Operation::copy_from_context("/src", "/app"))
//!                     .with_dependency("env"),
//!             ),
//!     );
//!
//! let scheduler = Scheduler::new(
//!     ExecutionDispatcher::standard(Arc::new(NullCommandRunner)),
//!     Arc::new(MemorySnapshotter::new()),
//!     Arc::new(MemoryCache::new()),
//!     Reporter::new(),
//!     SchedulerConfig::default(),
//! );
//! let result = scheduler.execute(&graph).await?;
//! println!("built {} platform(s)", result.manifests.len());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod constants;
pub mod context;
pub mod digest;
pub mod error;
pub mod executor;
pub mod graph;
pub mod platform;
pub mod reporter;
pub mod scheduler;
pub mod snapshot;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{BuildCache, CacheKey, CacheStatistics, CachedResult, MemoryCache};
pub use context::{ExecutionContext, ImageConfig, SharedStageContext};
pub use digest::Digest;
pub use error::{Error, Result};
pub use executor::{
    CommandOutput, CommandRunner, ExecExecutor, ExecutionDispatcher, ExecutionResult,
    ExecutorCapabilities, FilesystemChange, FilesystemExecutor, ImageExecutor, MetadataExecutor,
    NullCommandRunner, OperationExecutor, UnknownExecutor,
};
pub use graph::{
    BuildGraph, BuildNode, BuildStage, Command, Environment, ExecOperation, FilesystemAction,
    FilesystemOperation, FilesystemSource, ImageOperation, ImageSource, MetadataAction,
    MetadataOperation, NodeConstraints, Operation, OperationKind, OperationMetadata, RetryPolicy,
    SourceLocation, StageRef, User,
};
pub use platform::Platform;
pub use reporter::{BuildEvent, EventCollector, ReportContext, Reporter};
pub use scheduler::{
    BuildResult, CancellationFlag, DependencyAnalyzer, ExecutionMetrics, ExecutionState,
    ImageManifest, MetricsCollector, ParallelizationPlan, ResourceMonitor, Scheduler,
    SchedulerConfig, StageAnalysis, WorkQueueManager,
};
pub use snapshot::{MemorySnapshotter, Snapshot, Snapshotter};
