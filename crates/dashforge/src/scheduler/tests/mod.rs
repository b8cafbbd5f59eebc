// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Scenario tests for the scheduler.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod multistage_tests;
mod pipeline_tests;

use super::*;
use crate::cache::MemoryCache;
use crate::executor::{
    FilesystemExecutor, ImageExecutor, MetadataExecutor, OperationExecutor, UnknownExecutor,
};
use crate::graph::StageRef;
use crate::reporter::EventCollector;
use crate::snapshot::MemorySnapshotter;
use crate::test_support::{
    event_names, started_count, started_index, terminal_count, terminal_index, ScriptedExecutor,
};

/// Everything a scenario needs: a scheduler wired to the scripted exec
/// executor, the shared cache, and the reporter.
pub(crate) struct Harness {
    pub scheduler: Scheduler,
    pub reporter: Reporter,
    pub cache: Arc<MemoryCache>,
    pub scripted: Arc<ScriptedExecutor>,
}

impl Harness {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_cache(config, Arc::new(MemoryCache::new()))
    }

    /// Share a cache across harnesses to model persistent caching between
    /// builds.
    pub fn with_cache(config: SchedulerConfig, cache: Arc<MemoryCache>) -> Self {
        let scripted = Arc::new(ScriptedExecutor::new());
        let dispatcher = ExecutionDispatcher::new(vec![
            Arc::clone(&scripted) as Arc<dyn OperationExecutor>,
            Arc::new(ImageExecutor::new()),
            Arc::new(FilesystemExecutor::new()),
            Arc::new(MetadataExecutor::new()),
            Arc::new(UnknownExecutor::new()),
        ]);
        let reporter = Reporter::new();
        let scheduler = Scheduler::new(
            dispatcher,
            Arc::new(MemorySnapshotter::new()),
            Arc::clone(&cache) as Arc<dyn BuildCache>,
            reporter.clone(),
            config,
        );
        Self {
            scheduler,
            reporter,
            cache,
            scripted,
        }
    }

    /// Execute the graph, drain the reporter through a completion handler,
    /// and return the result with every emitted event.
    pub async fn run(&self, graph: &BuildGraph) -> (Result<BuildResult>, Vec<BuildEvent>) {
        let collector = EventCollector::attach(&self.reporter);
        let reporter = self.reporter.clone();
        self.scheduler.on_completion(move || reporter.finish());
        let result = self.scheduler.execute(graph).await;
        let events = collector.drain().await;
        (result, events)
    }
}

/// The single-stage boundary graph: `FROM scratch`, `ENV K=V`, then a
/// context copy depending on it.
pub(crate) fn single_stage_graph() -> BuildGraph {
    BuildGraph::new()
        .with_platform(Platform::linux_amd64())
        .with_stage(
            BuildStage::new("app", Operation::from_scratch())
                .with_node(BuildNode::new("env", Operation::env("K", "V")))
                .with_node(
                    BuildNode::new("copy", Operation::copy_from_context("/src", "/dst"))
                        .with_dependency("env"),
                ),
        )
}

/// A diamond of exec nodes: prepare -> (left, right) -> join.
pub(crate) fn diamond_graph() -> BuildGraph {
    BuildGraph::new()
        .with_platform(Platform::linux_amd64())
        .with_stage(
            BuildStage::new("app", Operation::from_scratch())
                .with_node(BuildNode::new("prepare", Operation::run("prepare", vec![])))
                .with_node(
                    BuildNode::new("left", Operation::run("left", vec![]))
                        .with_dependency("prepare"),
                )
                .with_node(
                    BuildNode::new("right", Operation::run("right", vec![]))
                        .with_dependency("prepare"),
                )
                .with_node(
                    BuildNode::new("join", Operation::run("join", vec![]))
                        .with_dependencies(["left", "right"]),
                ),
        )
}

/// Builder/runtime pair where runtime copies `/out` from builder.
pub(crate) fn multistage_graph() -> BuildGraph {
    BuildGraph::new()
        .with_platform(Platform::linux_amd64())
        .with_stage(
            BuildStage::new("builder", Operation::from_registry("golang:1.22")).with_node(
                BuildNode::new("compile", Operation::run("go", vec!["build".to_string()])),
            ),
        )
        .with_stage(
            BuildStage::new("runtime", Operation::from_scratch()).with_node(BuildNode::new(
                "copy-out",
                Operation::copy_from_stage(
                    StageRef::Named("builder".to_string()),
                    vec!["/out".to_string()],
                    "/out",
                ),
            )),
        )
}

#[tokio::test]
async fn test_config_defaults() {
    let config = SchedulerConfig::default();
    assert_eq!(config.max_concurrency, crate::constants::default_max_concurrency());
    assert_eq!(config.max_memory_usage, 8 * 1024 * 1024 * 1024);
    assert!(config.enable_work_stealing);
    assert!(config.enable_priority_scheduling);
    assert_eq!(config.monitoring_interval, Duration::from_millis(500));
    assert!(config.fail_fast);
    assert!(config.enable_progress_reporting);
}

#[tokio::test]
async fn test_metrics_collector_snapshot() {
    let metrics = MetricsCollector::new();
    metrics.record_operation();
    metrics.record_operation();
    metrics.record_cache_hit();
    metrics.record_retry();
    metrics.record_stage("app@linux/amd64".to_string(), Duration::from_millis(7));

    let snapshot = metrics.snapshot(Duration::from_millis(10));
    assert_eq!(snapshot.operations_executed, 2);
    assert_eq!(snapshot.cache_hits, 1);
    assert_eq!(snapshot.retries, 1);
    assert_eq!(snapshot.stages_completed, 1);
    assert_eq!(snapshot.total_duration, Duration::from_millis(10));

    metrics.reset();
    assert_eq!(metrics.snapshot(Duration::ZERO).operations_executed, 0);
}

#[test]
fn test_error_preference_ranks_real_failures_first() {
    let cancelled = prefer_error(None, Error::Cancelled);
    let surfaced = prefer_error(
        cancelled,
        Error::OperationFailed {
            description: "RUN a".to_string(),
            source: Box::new(Error::Execution("boom".to_string())),
        },
    );
    assert!(matches!(surfaced, Some(Error::OperationFailed { .. })));

    // An earlier real failure is not displaced by later cancellations.
    let kept = prefer_error(surfaced, Error::Cancelled);
    assert!(matches!(kept, Some(Error::OperationFailed { .. })));
}
