// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The parallel build scheduler.
//!
//! [`Scheduler::execute`] drives one end-to-end build of a [`BuildGraph`]:
//! analysis first (cycles and cross-stage references fail before anything
//! runs), then per-platform parallel execution - all base images in
//! parallel, stages as their `COPY --from` dependencies complete, nodes in
//! Kahn layers gated by the [`state::ExecutionState`] barrier - with
//! caching, bounded retries, resource throttling, and cancellation at every
//! suspension point.

pub mod analysis;
pub mod queue;
pub mod resources;
pub mod state;

#[cfg(test)]
mod tests;

pub use analysis::{DependencyAnalyzer, DependencyGraph, ParallelizationPlan, StageAnalysis};
pub use queue::{QueueMetrics, WorkQueueManager};
pub use resources::ResourceMonitor;
pub use state::{CancellationFlag, ExecutionState};

use crate::cache::{BuildCache, CacheKey, CacheStatistics, CachedResult};
use crate::constants::{
    default_max_concurrency, DEFAULT_MAX_MEMORY_USAGE, DEFAULT_MONITORING_INTERVAL,
    DIAGNOSTIC_ENV_ENTRIES,
};
use crate::context::{ExecutionContext, ImageConfig, SharedStageContext};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::executor::{ExecutionDispatcher, ExecutionResult};
use crate::graph::{
    BuildGraph, BuildNode, BuildStage, FilesystemSource, NodeConstraints, Operation,
};
use crate::platform::Platform;
use crate::reporter::{BuildEvent, ReportContext, Reporter};
use crate::snapshot::Snapshotter;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Runtime configuration for one scheduler instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Resource slots and work-queue workers. Default: two per logical CPU.
    pub max_concurrency: usize,
    /// Memory ceiling observed by the resource monitor. Default: 8 GiB.
    pub max_memory_usage: u64,
    /// Run group tasks on the work-stealing queues instead of plain spawns.
    pub enable_work_stealing: bool,
    /// Start wider nodes (more dependents) first within a group.
    pub enable_priority_scheduling: bool,
    /// Interval of the resource monitor's utilization poll.
    pub monitoring_interval: Duration,
    /// Cancel sibling work on the first failure.
    pub fail_fast: bool,
    /// Emit reporter events.
    pub enable_progress_reporting: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_memory_usage: DEFAULT_MAX_MEMORY_USAGE,
            enable_work_stealing: true,
            enable_priority_scheduling: true,
            monitoring_interval: DEFAULT_MONITORING_INTERVAL,
            fail_fast: true,
            enable_progress_reporting: true,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    #[must_use]
    pub fn with_work_stealing(mut self, enabled: bool) -> Self {
        self.enable_work_stealing = enabled;
        self
    }

    #[must_use]
    pub fn with_priority_scheduling(mut self, enabled: bool) -> Self {
        self.enable_priority_scheduling = enabled;
        self
    }

    #[must_use]
    pub fn with_monitoring_interval(mut self, interval: Duration) -> Self {
        self.monitoring_interval = interval;
        self
    }

    #[must_use]
    pub fn with_progress_reporting(mut self, enabled: bool) -> Self {
        self.enable_progress_reporting = enabled;
        self
    }
}

/// Aggregated counters for one build.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub operations_executed: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub stages_completed: u64,
    pub total_duration: Duration,
    /// Wall time per `stage@platform`.
    pub stage_durations: BTreeMap<String, Duration>,
}

/// Thread-safe metrics accumulation across all build tasks.
#[derive(Default)]
pub struct MetricsCollector {
    operations_executed: AtomicU64,
    cache_hits: AtomicU64,
    retries: AtomicU64,
    stages_completed: AtomicU64,
    stage_durations: Mutex<BTreeMap<String, Duration>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_operation(&self) {
        self.operations_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage(&self, key: String, duration: Duration) {
        self.stages_completed.fetch_add(1, Ordering::Relaxed);
        self.stage_durations.lock().insert(key, duration);
    }

    pub fn snapshot(&self, total_duration: Duration) -> ExecutionMetrics {
        ExecutionMetrics {
            operations_executed: self.operations_executed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            stages_completed: self.stages_completed.load(Ordering::Relaxed),
            total_duration,
            stage_durations: self.stage_durations.lock().clone(),
        }
    }

    pub fn reset(&self) {
        self.operations_executed.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.stages_completed.store(0, Ordering::Relaxed);
        self.stage_durations.lock().clear();
    }
}

/// One platform's build artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub digest: Digest,
    pub size: u64,
    /// Digest of the canonical image config JSON.
    pub config_digest: Digest,
    pub layers: Vec<Digest>,
}

/// The outcome of a completed build.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildResult {
    pub session_id: uuid::Uuid,
    pub manifests: BTreeMap<Platform, ImageManifest>,
    pub metrics: ExecutionMetrics,
    pub cache_statistics: CacheStatistics,
    /// Per-stage summary lines; the full stream is on the reporter.
    pub logs: Vec<String>,
}

type CompletionHandler = Box<dyn FnOnce() + Send>;

/// Lower-ranked errors are superseded when picking the error to surface:
/// a real operation failure always wins over the cancellations it caused.
fn error_rank(error: &Error) -> u8 {
    match error {
        Error::DependencyFailed(_) => 0,
        Error::Cancelled => 1,
        _ => 2,
    }
}

fn prefer_error(current: Option<Error>, new: Error) -> Option<Error> {
    match current {
        None => Some(new),
        Some(current) if error_rank(&new) > error_rank(&current) => Some(new),
        Some(current) => Some(current),
    }
}

/// The orchestration core. All collaborators are injected; the scheduler
/// holds no global state.
pub struct Scheduler {
    dispatcher: Arc<ExecutionDispatcher>,
    snapshotter: Arc<dyn Snapshotter>,
    cache: Arc<dyn BuildCache>,
    reporter: Reporter,
    config: SchedulerConfig,
    state: Arc<ExecutionState>,
    resources: Arc<ResourceMonitor>,
    cancellation: Arc<CancellationFlag>,
    metrics: Arc<MetricsCollector>,
    running: AtomicBool,
    completion_handlers: Mutex<Vec<CompletionHandler>>,
}

impl Scheduler {
    pub fn new(
        dispatcher: ExecutionDispatcher,
        snapshotter: Arc<dyn Snapshotter>,
        cache: Arc<dyn BuildCache>,
        reporter: Reporter,
        config: SchedulerConfig,
    ) -> Self {
        let resources = Arc::new(ResourceMonitor::new(config.max_concurrency));
        Self {
            dispatcher: Arc::new(dispatcher),
            snapshotter,
            cache,
            reporter,
            config,
            state: Arc::new(ExecutionState::new()),
            resources,
            cancellation: Arc::new(CancellationFlag::new()),
            metrics: Arc::new(MetricsCollector::new()),
            running: AtomicBool::new(false),
            completion_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Signal cancellation to all in-flight work and refuse new work.
    /// Idempotent; sticky until [`reset`](Self::reset).
    pub fn cancel(&self) {
        tracing::info!("build cancellation requested");
        self.cancellation.cancel();
        self.state.cancel();
        self.resources.shutdown();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Clear execution state between builds on a reused instance.
    pub fn reset(&self) {
        self.state.reset();
        self.cancellation.reset();
        self.resources.reset();
        self.metrics.reset();
    }

    /// Register a hook that runs after the build, before `execute` returns.
    /// Typical use: draining the reporter.
    pub fn on_completion(&self, handler: impl FnOnce() + Send + 'static) {
        self.completion_handlers.lock().push(Box::new(handler));
    }

    /// Execute one build. Exclusive per instance: a second concurrent call
    /// fails with an internal error.
    pub async fn execute(&self, graph: &BuildGraph) -> Result<BuildResult> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal(
                "execute is not re-entrant; the scheduler is already running".to_string(),
            ));
        }
        let result = self.execute_inner(graph).await;
        let handlers: Vec<CompletionHandler> =
            std::mem::take(&mut *self.completion_handlers.lock());
        for handler in handlers {
            handler();
        }
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn execute_inner(&self, graph: &BuildGraph) -> Result<BuildResult> {
        if self.cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let plan = Arc::new(DependencyAnalyzer::analyze(graph)?);
        let graph = Arc::new(graph.clone());
        let session_id = uuid::Uuid::new_v4();
        let started = Instant::now();
        tracing::info!(
            %session_id,
            stages = plan.order.len(),
            platforms = graph.target_platforms.len(),
            "starting build"
        );

        self.report(BuildEvent::BuildStarted {
            total_operations: plan.total_operations * graph.target_platforms.len(),
            stages: plan.order.len(),
            timestamp: Utc::now(),
        });

        // The poll has its own lifetime flag so a successful build can stop
        // it without tripping build-level cancellation.
        let poll_flag = Arc::new(CancellationFlag::new());
        let poll_handle = ResourceMonitor::spawn_utilization_poll(
            &self.resources,
            self.config.monitoring_interval,
            self.config.max_memory_usage,
            Arc::clone(&poll_flag),
        );

        let queues = self
            .config
            .enable_work_stealing
            .then(|| WorkQueueManager::new(self.config.max_concurrency));

        let mut platform_tasks: JoinSet<Result<(Platform, ImageManifest)>> = JoinSet::new();
        for platform in graph.target_platforms.iter().cloned() {
            let run = Arc::new(PlatformRun {
                graph: Arc::clone(&graph),
                plan: Arc::clone(&plan),
                platform: platform.clone(),
                dispatcher: Arc::clone(&self.dispatcher),
                snapshotter: Arc::clone(&self.snapshotter),
                cache: Arc::clone(&self.cache),
                reporter: self.reporter.clone(),
                state: Arc::clone(&self.state),
                resources: Arc::clone(&self.resources),
                cancellation: Arc::clone(&self.cancellation),
                metrics: Arc::clone(&self.metrics),
                config: self.config.clone(),
                queues: queues.clone(),
                stages_ctx: Arc::new(SharedStageContext::new()),
            });
            platform_tasks.spawn(async move {
                let manifest = run.run().await?;
                Ok((platform, manifest))
            });
        }

        let mut manifests = BTreeMap::new();
        let mut build_error: Option<Error> = None;
        while let Some(joined) = platform_tasks.join_next().await {
            match joined {
                Ok(Ok((platform, manifest))) => {
                    manifests.insert(platform, manifest);
                }
                Ok(Err(error)) => {
                    if build_error.is_none() {
                        // First surfaced error cancels the remaining
                        // platform units.
                        self.cancel();
                    }
                    build_error = prefer_error(build_error, error);
                }
                Err(join_error) => {
                    if !join_error.is_cancelled() {
                        build_error = prefer_error(
                            build_error,
                            Error::Internal(format!("platform task panicked: {join_error}")),
                        );
                    }
                }
            }
        }

        if let Some(queues) = &queues {
            queues.cancel();
            queues.join().await;
        }
        poll_flag.cancel();
        let _ = poll_handle.await;

        match build_error {
            Some(error) => {
                tracing::error!(%session_id, %error, "build failed");
                self.report(BuildEvent::BuildCompleted {
                    success: false,
                    timestamp: Utc::now(),
                });
                Err(error)
            }
            None => {
                let metrics = self.metrics.snapshot(started.elapsed());
                let cache_statistics = self.cache.statistics().await;
                let logs = metrics
                    .stage_durations
                    .iter()
                    .map(|(stage, duration)| format!("{stage}: completed in {duration:?}"))
                    .collect();
                tracing::info!(%session_id, duration = ?metrics.total_duration, "build completed");
                self.report(BuildEvent::BuildCompleted {
                    success: true,
                    timestamp: Utc::now(),
                });
                Ok(BuildResult {
                    session_id,
                    manifests,
                    metrics,
                    cache_statistics,
                    logs,
                })
            }
        }
    }

    fn report(&self, event: BuildEvent) {
        if self.config.enable_progress_reporting {
            self.reporter.emit(event);
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

/// A completed stage's contribution to the platform artifact.
struct StageOutcome {
    snapshot: crate::snapshot::Snapshot,
    config: ImageConfig,
    layers: Vec<Digest>,
}

/// One platform's execution unit: shared handles plus the per-platform
/// stage snapshot registry.
struct PlatformRun {
    graph: Arc<BuildGraph>,
    plan: Arc<ParallelizationPlan>,
    platform: Platform,
    dispatcher: Arc<ExecutionDispatcher>,
    snapshotter: Arc<dyn Snapshotter>,
    cache: Arc<dyn BuildCache>,
    reporter: Reporter,
    state: Arc<ExecutionState>,
    resources: Arc<ResourceMonitor>,
    cancellation: Arc<CancellationFlag>,
    metrics: Arc<MetricsCollector>,
    config: SchedulerConfig,
    queues: Option<Arc<WorkQueueManager>>,
    stages_ctx: Arc<SharedStageContext>,
}

impl PlatformRun {
    async fn run(self: Arc<Self>) -> Result<ImageManifest> {
        // Base images of every selected stage resolve in parallel.
        let mut base_tasks: JoinSet<Result<()>> = JoinSet::new();
        for stage_id in &self.plan.order {
            let run = Arc::clone(&self);
            let stage_id = stage_id.clone();
            base_tasks.spawn(async move { run.resolve_base(&stage_id).await });
        }
        let mut first_error: Option<Error> = None;
        while let Some(joined) = base_tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => first_error = prefer_error(first_error, error),
                Err(join_error) if !join_error.is_cancelled() => {
                    first_error = prefer_error(
                        first_error,
                        Error::Internal(format!("base task panicked: {join_error}")),
                    );
                }
                Err(_) => {}
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        // Iterative rounds: execute every stage whose dependencies are met.
        let mut completed: BTreeSet<String> = BTreeSet::new();
        let mut outcomes: HashMap<String, StageOutcome> = HashMap::new();
        while completed.len() < self.plan.order.len() {
            if self.cancellation.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let ready: Vec<String> = self
                .plan
                .order
                .iter()
                .filter(|id| !completed.contains(*id))
                .filter(|id| {
                    self.plan
                        .stages
                        .get(*id)
                        .map(|a| a.stage_dependencies.iter().all(|d| completed.contains(d)))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                return Err(Error::CyclicDependency(
                    "no executable stages remain".to_string(),
                ));
            }

            let mut stage_tasks: JoinSet<Result<(String, StageOutcome)>> = JoinSet::new();
            for stage_id in &ready {
                let run = Arc::clone(&self);
                let stage_id = stage_id.clone();
                stage_tasks.spawn(async move { run.execute_stage(stage_id).await });
            }
            let mut round_error: Option<Error> = None;
            while let Some(joined) = stage_tasks.join_next().await {
                match joined {
                    Ok(Ok((stage_id, outcome))) => {
                        outcomes.insert(stage_id, outcome);
                    }
                    Ok(Err(error)) => round_error = prefer_error(round_error, error),
                    Err(join_error) if !join_error.is_cancelled() => {
                        round_error = prefer_error(
                            round_error,
                            Error::Internal(format!("stage task panicked: {join_error}")),
                        );
                    }
                    Err(_) => {}
                }
            }
            if let Some(error) = round_error {
                return Err(error);
            }
            completed.extend(ready);
        }

        // The plan's order ends at the target stage.
        let target_id = self
            .plan
            .order
            .last()
            .ok_or_else(|| Error::Internal("empty execution order".to_string()))?;
        let outcome = outcomes
            .remove(target_id)
            .ok_or_else(|| Error::Internal(format!("no outcome for target stage '{target_id}'")))?;
        let config_digest = outcome.config.digest()?;
        Ok(ImageManifest {
            digest: outcome.snapshot.digest,
            size: outcome.snapshot.size,
            config_digest,
            layers: outcome.layers,
        })
    }

    /// Dispatch a stage's base image and record its snapshot for seeding and
    /// `COPY --from` references. Base results are not cached: realizing a
    /// base is the snapshotter/registry boundary's concern.
    async fn resolve_base(&self, stage_id: &str) -> Result<()> {
        let stage = self.stage(stage_id)?;
        let analysis = self.plan.analysis(stage_id)?;
        self.report(BuildEvent::StageStarted {
            stage: stage.display_name().to_string(),
            platform: self.platform.clone(),
            timestamp: Utc::now(),
        });

        let ctx = self.stage_context(stage, analysis);
        let node_id = format!("{stage_id}/base");
        let node_key = self.node_key(stage_id, "base");
        let description = stage.base.describe();
        self.report(BuildEvent::OperationStarted {
            context: self.report_context(&node_id, stage, &description),
        });
        self.state.increment_operations();

        match self
            .attempt_operation(&stage.base, &ctx, None, &node_key, None)
            .await
        {
            Ok(result) => {
                self.stages_ctx.record_base(&stage.id, result.snapshot);
                self.metrics.record_operation();
                self.report(BuildEvent::OperationFinished {
                    context: self.report_context(&node_id, stage, &description),
                    duration: result.duration,
                });
                Ok(())
            }
            Err(error) => {
                self.report(BuildEvent::OperationFailed {
                    context: self.report_context(&node_id, stage, &description),
                    error: error.to_string(),
                    diagnostics: self.diagnostics(&ctx, &error),
                });
                if matches!(error, Error::Cancelled) {
                    return Err(Error::Cancelled);
                }
                Err(Error::OperationFailed {
                    description,
                    source: Box::new(error),
                })
            }
        }
    }

    /// Execute one stage's groups in order against a fresh context seeded
    /// with the stage's base snapshot.
    async fn execute_stage(self: Arc<Self>, stage_id: String) -> Result<(String, StageOutcome)> {
        let stage = self.stage(&stage_id)?;
        let analysis = self.plan.analysis(&stage_id)?;
        let started = Instant::now();

        let ctx = self.stage_context(stage, analysis);
        let base = self.stages_ctx.base(&stage_id).ok_or_else(|| {
            Error::Internal(format!("stage '{stage_id}' has no base snapshot"))
        })?;
        ctx.seed_base_snapshot(base);

        let mut stage_error: Option<Error> = None;
        for group in &analysis.groups {
            if self.cancellation.is_cancelled() {
                stage_error = prefer_error(stage_error, Error::Cancelled);
                break;
            }
            match Self::execute_group(&self, stage, analysis, &ctx, group).await {
                Ok(()) => {}
                Err(error) => {
                    if self.config.fail_fast {
                        stage_error = prefer_error(stage_error, error);
                        break;
                    }
                    // Record and continue: dependents of the failed nodes
                    // short-circuit through the barrier, independent branches
                    // keep running.
                    stage_error = prefer_error(stage_error, error);
                }
            }
            // Close the group deterministically: the stage snapshot becomes
            // that of the last node in declaration order that produced one,
            // and the group environment is re-pinned.
            let group_snapshot = group
                .iter()
                .rev()
                .find_map(|node_id| ctx.snapshot_for(node_id));
            ctx.advance_group(group_snapshot);
        }
        if let Some(error) = stage_error {
            return Err(error);
        }

        let final_snapshot = ctx.latest_snapshot().ok_or_else(|| {
            Error::Internal(format!("stage '{stage_id}' produced no snapshot"))
        })?;
        self.stages_ctx.record_final(&stage_id, final_snapshot);

        // Layer digests in declaration order, deduplicating metadata nodes
        // that share their predecessor's snapshot.
        let mut layers = vec![base.digest];
        for node in &stage.nodes {
            if let Some(snapshot) = ctx.snapshot_for(&node.id) {
                if layers.last() != Some(&snapshot.digest) {
                    layers.push(snapshot.digest);
                }
            }
        }

        let stage_key = format!("{}@{}", stage.display_name(), self.platform);
        self.metrics.record_stage(stage_key, started.elapsed());
        self.report(BuildEvent::StageCompleted {
            stage: stage.display_name().to_string(),
            platform: self.platform.clone(),
            timestamp: Utc::now(),
        });

        Ok((
            stage_id,
            StageOutcome {
                snapshot: final_snapshot,
                config: ctx.image_config(),
                layers,
            },
        ))
    }

    /// Run one parallelizable group. Slots are bulk-acquired up front
    /// (clamped to current capacity so a wide layer cannot deadlock) and
    /// released as nodes finish.
    async fn execute_group(
        run: &Arc<Self>,
        stage: &BuildStage,
        analysis: &StageAnalysis,
        ctx: &Arc<ExecutionContext>,
        group: &[String],
    ) -> Result<()> {
        let mut ordered: Vec<String> = group.to_vec();
        if run.config.enable_priority_scheduling {
            // Stable sort: declaration order persists within equal weights.
            ordered.sort_by_key(|id| std::cmp::Reverse(analysis.graph.dependent_count(id)));
        }

        let slots = ordered.len().min(run.resources.capacity());
        run.resources.wait_for_resources(slots).await?;
        let permits = Arc::new(AtomicUsize::new(slots));
        let group_cancel = Arc::new(CancellationFlag::new());

        let mut first_error: Option<Error> = None;
        let (tx, mut rx) = mpsc::unbounded_channel::<Result<()>>();
        let mut expected = 0usize;
        let mut join_set: Option<JoinSet<()>> = match &run.queues {
            Some(_) => None,
            None => Some(JoinSet::new()),
        };

        for node_id in &ordered {
            let node = match stage.node(node_id) {
                Some(node) => node.clone(),
                None => {
                    return Err(Error::Internal(format!(
                        "group references unknown node '{node_id}'"
                    )))
                }
            };
            let task_run = Arc::clone(run);
            let task_ctx = Arc::clone(ctx);
            let task_stage = stage.clone();
            let task_cancel = Arc::clone(&group_cancel);
            let task_permits = Arc::clone(&permits);
            let task_tx = tx.clone();
            let task = async move {
                let result = task_run
                    .run_node(&task_stage, &task_ctx, &node, &task_cancel)
                    .await;
                Self::release_permit(&task_permits, &task_run.resources);
                let _ = task_tx.send(result);
            };
            let submitted = match (&run.queues, &mut join_set) {
                (Some(queues), _) => queues.submit(task),
                (None, Some(join_set)) => {
                    join_set.spawn(task);
                    true
                }
                (None, None) => false,
            };
            if submitted {
                expected += 1;
            } else {
                first_error = prefer_error(first_error, Error::Cancelled);
            }
        }
        drop(tx);

        for _ in 0..expected {
            match rx.recv().await {
                Some(Ok(())) => {}
                Some(Err(error)) => {
                    if run.config.fail_fast && first_error.is_none() {
                        // Wake sleeping siblings; not-yet-started ones
                        // short-circuit before emitting anything.
                        group_cancel.cancel();
                    }
                    first_error = prefer_error(first_error, error);
                }
                None => {
                    first_error = prefer_error(first_error, Error::Cancelled);
                    break;
                }
            }
        }
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        // Permits not released by their nodes (dropped queue tasks).
        let remaining = permits.swap(0, Ordering::SeqCst);
        if remaining > 0 {
            run.resources.release_many(remaining);
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn release_permit(permits: &AtomicUsize, resources: &ResourceMonitor) {
        let mut current = permits.load(Ordering::SeqCst);
        while current > 0 {
            match permits.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    resources.release_resource();
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Execute one node: dependency barrier, cache lookup, dispatch with
    /// bounded retry, result recording, events.
    async fn run_node(
        &self,
        stage: &BuildStage,
        ctx: &Arc<ExecutionContext>,
        node: &BuildNode,
        group_cancel: &CancellationFlag,
    ) -> Result<()> {
        let node_key = self.node_key(&stage.id, &node.id);
        for dependency in &node.dependencies {
            match self
                .state
                .wait_for_node(&self.node_key(&stage.id, dependency))
                .await
            {
                Ok(()) => {}
                Err(error @ Error::DependencyFailed(_)) => {
                    // Never started: no events, dependents short-circuit too.
                    self.state.mark_node_failed(&node_key);
                    return Err(error);
                }
                Err(error) => return Err(error),
            }
        }
        if self.cancellation.is_cancelled() || group_cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let operation = &node.operation;
        let description = operation.describe();
        self.report(BuildEvent::OperationStarted {
            context: self.report_context(&node.id, stage, &description),
        });
        self.state.increment_operations();

        let key = self.cache_key(ctx, node);
        if let Some(hit) = self.cache.get(&key, operation).await {
            ctx.merge_environment(&hit.environment_changes);
            for action in &hit.metadata_changes {
                ctx.apply_metadata(action);
            }
            ctx.record_snapshot(&node.id, hit.snapshot);
            self.state.increment_cache_hits();
            self.metrics.record_cache_hit();
            self.report(BuildEvent::OperationCacheHit {
                context: self.report_context(&node.id, stage, &description),
            });
            self.state.mark_node_completed(&node_key);
            return Ok(());
        }

        match self
            .attempt_operation(
                operation,
                ctx.as_ref(),
                Some(&node.constraints),
                &node_key,
                Some(group_cancel),
            )
            .await
        {
            Ok(result) => {
                ctx.record_snapshot(&node.id, result.snapshot);
                if let Some(output) = &result.output {
                    for message in [&output.stdout, &output.stderr] {
                        if !message.is_empty() {
                            self.report(BuildEvent::OperationLog {
                                context: self.report_context(&node.id, stage, &description),
                                message: message.trim_end().to_string(),
                            });
                        }
                    }
                }
                // No cache writes once cancellation is in flight.
                if !self.cancellation.is_cancelled() {
                    let entry = CachedResult {
                        snapshot: result.snapshot,
                        environment_changes: result.environment_changes.clone(),
                        metadata_changes: result.metadata_changes.clone(),
                    };
                    self.cache.put(&key, operation, entry).await;
                }
                self.metrics.record_operation();
                self.report(BuildEvent::OperationFinished {
                    context: self.report_context(&node.id, stage, &description),
                    duration: result.duration,
                });
                self.state.mark_node_completed(&node_key);
                Ok(())
            }
            Err(error) => {
                self.state.mark_node_failed(&node_key);
                self.report(BuildEvent::OperationFailed {
                    context: self.report_context(&node.id, stage, &description),
                    error: error.to_string(),
                    diagnostics: self.diagnostics(ctx, &error),
                });
                if matches!(error, Error::Cancelled) {
                    // Cancellation surfaces as itself, not as an operation
                    // failure, so the causing error wins at the group level.
                    return Err(Error::Cancelled);
                }
                Err(Error::OperationFailed {
                    description,
                    source: Box::new(error),
                })
            }
        }
    }

    /// The bounded retry loop shared by node and base dispatches. Cancelled
    /// builds abandon the in-flight attempt at the next suspension point.
    async fn attempt_operation(
        &self,
        operation: &Operation,
        ctx: &ExecutionContext,
        constraints: Option<&NodeConstraints>,
        node_id: &str,
        group_cancel: Option<&CancellationFlag>,
    ) -> Result<ExecutionResult> {
        let policy = operation.retry_policy();
        let attempts = policy.max_retries.max(1);
        for attempt in 1..=attempts {
            if self.is_cancelled(group_cancel) {
                return Err(Error::Cancelled);
            }
            if attempt > 1 {
                let delay = policy.delay_before_retry(attempt - 1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancelled_any(group_cancel) => return Err(Error::Cancelled),
                }
                self.state.record_retry(node_id);
                self.metrics.record_retry();
                tracing::warn!(node = node_id, attempt, "retrying operation");
            }
            let outcome = tokio::select! {
                result = self.dispatcher.dispatch(operation, ctx, constraints) => result,
                _ = self.cancelled_any(group_cancel) => Err(Error::Cancelled),
            };
            match outcome {
                Ok(result) => return Ok(result),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(error) => {
                    if !error.is_retryable() || attempt == attempts {
                        return Err(error);
                    }
                    tracing::debug!(node = node_id, %error, "attempt failed, will retry");
                }
            }
        }
        Err(Error::Internal("retry loop exhausted without outcome".to_string()))
    }

    fn is_cancelled(&self, group_cancel: Option<&CancellationFlag>) -> bool {
        self.cancellation.is_cancelled()
            || group_cancel.map(CancellationFlag::is_cancelled).unwrap_or(false)
    }

    async fn cancelled_any(&self, group_cancel: Option<&CancellationFlag>) {
        match group_cancel {
            Some(group) => tokio::select! {
                _ = self.cancellation.cancelled() => {}
                _ = group.cancelled() => {}
            },
            None => self.cancellation.cancelled().await,
        }
    }

    /// The node's cache key: operation digest, the context's current
    /// snapshot, each dependency's snapshot, and - for cross-stage sources -
    /// the source stage's final snapshot, so a changed producer invalidates
    /// the consumer. An uncomputable key degrades to a guaranteed miss.
    fn cache_key(&self, ctx: &ExecutionContext, node: &BuildNode) -> CacheKey {
        let mut inputs = Vec::new();
        if let Some(latest) = ctx.latest_snapshot() {
            inputs.push(latest.digest);
        }
        for dependency in &node.dependencies {
            match ctx.snapshot_for(dependency) {
                Some(snapshot) => inputs.push(snapshot.digest),
                None => {
                    tracing::warn!(
                        node = %node.id,
                        %dependency,
                        "dependency snapshot missing, using degenerate cache key"
                    );
                    return CacheKey::degenerate(self.platform.clone());
                }
            }
        }
        match &node.operation {
            // A changed producer stage must invalidate the consumer even
            // though the copy operation itself is unchanged.
            Operation::Filesystem(fs) => {
                if let FilesystemSource::Stage { stage, .. } = &fs.source {
                    let resolved = ctx
                        .resolve_stage_ref(&stage.to_string())
                        .and_then(|id| self.stages_ctx.final_snapshot(id));
                    match resolved {
                        Some(snapshot) => inputs.push(snapshot.digest),
                        None => return CacheKey::degenerate(self.platform.clone()),
                    }
                }
            }
            // Commands behave differently under a different accumulated
            // environment, working directory, or user; fold that execution
            // context into the key so equal keys stay interchangeable.
            Operation::Exec(_) => {
                let mut writer = crate::digest::DigestWriter::new();
                writer.list_field("environment", &ctx.group_environment().to_lines());
                writer.optional_field(
                    "working_directory",
                    ctx.group_working_directory().as_deref(),
                );
                writer.optional_field("user", ctx.group_user().map(|u| u.to_string()).as_deref());
                inputs.push(writer.finish());
            }
            _ => {}
        }
        CacheKey::new(node.operation.content_digest(), inputs, self.platform.clone())
    }

    fn diagnostics(&self, ctx: &ExecutionContext, error: &Error) -> BTreeMap<String, String> {
        let mut diagnostics = BTreeMap::new();
        diagnostics.insert("platform".to_string(), self.platform.to_string());
        diagnostics.insert("stage".to_string(), ctx.stage_id().to_string());
        if let Some(working_directory) = ctx.working_directory() {
            diagnostics.insert("working_directory".to_string(), working_directory);
        }
        if let Some(user) = ctx.user() {
            diagnostics.insert("user".to_string(), user.to_string());
        }
        let environment: Vec<String> = ctx
            .environment()
            .to_lines()
            .into_iter()
            .take(DIAGNOSTIC_ENV_ENTRIES)
            .collect();
        if !environment.is_empty() {
            diagnostics.insert("environment".to_string(), environment.join(" "));
        }
        if let Error::CommandFailed { stderr, .. } = error {
            if !stderr.is_empty() {
                diagnostics.insert("log_tail".to_string(), stderr.clone());
            }
        }
        diagnostics
    }

    fn stage(&self, stage_id: &str) -> Result<&BuildStage> {
        self.graph
            .stage(stage_id)
            .ok_or_else(|| Error::Internal(format!("unknown stage '{stage_id}'")))
    }

    fn node_key(&self, stage_id: &str, node_id: &str) -> String {
        ExecutionState::scoped_key(&self.platform, stage_id, node_id)
    }

    fn stage_context(&self, stage: &BuildStage, analysis: &StageAnalysis) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(
            stage.id.clone(),
            self.platform.clone(),
            self.reporter.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.snapshotter),
            Arc::clone(&self.stages_ctx),
            Arc::new(analysis.stage_refs.clone()),
            Arc::clone(&self.cancellation),
        ))
    }

    fn report_context(&self, node_id: &str, stage: &BuildStage, description: &str) -> ReportContext {
        let mut context = ReportContext::new(node_id, stage.id.clone(), description);
        if let Some(location) = stage
            .node(node_id)
            .and_then(|n| n.operation.metadata())
            .and_then(|m| m.source_location.clone())
        {
            context = context.with_source_location(location);
        }
        context
    }

    fn report(&self, event: BuildEvent) {
        if self.config.enable_progress_reporting {
            self.reporter.emit(event);
        }
    }
}
