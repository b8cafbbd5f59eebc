// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Per-stage execution contexts and cross-stage snapshot sharing.

use crate::cache::BuildCache;
use crate::digest::Digest;
use crate::error::Result;
use crate::graph::{Environment, HealthcheckConfig, MetadataAction, User};
use crate::platform::Platform;
use crate::reporter::Reporter;
use crate::scheduler::state::CancellationFlag;
use crate::snapshot::{Snapshot, Snapshotter};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// The image configuration accumulated by metadata operations.
///
/// Serializes to canonical JSON (ordered maps and sets) so its digest is
/// stable across processes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub exposed_ports: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub working_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<User>,
    #[serde(default)]
    pub volumes: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stop_signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub healthcheck: Option<HealthcheckConfig>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub shell: Option<Vec<String>>,
    #[serde(default)]
    pub onbuild: Vec<String>,
    #[serde(default)]
    pub args: BTreeMap<String, Option<String>>,
}

impl ImageConfig {
    /// Apply one metadata action.
    pub fn apply(&mut self, action: &MetadataAction) {
        match action {
            MetadataAction::Env { key, value } => self.environment.set(key.clone(), value.clone()),
            MetadataAction::WorkingDirectory(dir) => self.working_directory = Some(dir.clone()),
            MetadataAction::User(user) => self.user = Some(user.clone()),
            MetadataAction::Entrypoint(parts) => self.entrypoint = Some(parts.clone()),
            MetadataAction::Cmd(parts) => self.cmd = Some(parts.clone()),
            MetadataAction::Label { key, value } => {
                self.labels.insert(key.clone(), value.clone());
            }
            MetadataAction::Arg { name, default } => {
                self.args.insert(name.clone(), default.clone());
            }
            MetadataAction::Expose(port) => {
                self.exposed_ports.insert(port.clone());
            }
            MetadataAction::StopSignal(signal) => self.stop_signal = Some(signal.clone()),
            MetadataAction::Healthcheck(config) => self.healthcheck = Some(config.clone()),
            MetadataAction::Shell(parts) => self.shell = Some(parts.clone()),
            MetadataAction::Volume(path) => {
                self.volumes.insert(path.clone());
            }
            MetadataAction::OnBuild(instruction) => self.onbuild.push(instruction.clone()),
        }
    }

    /// Digest of the canonical JSON serialization. Used as the manifest's
    /// config digest.
    pub fn digest(&self) -> Result<Digest> {
        let json = serde_json::to_vec(self)
            .map_err(|e| crate::error::Error::Internal(format!("image config encoding: {e}")))?;
        Ok(Digest::of(&json))
    }
}

/// Per-platform registry of stage snapshots, shared by every stage context
/// on that platform so `COPY --from` can observe other stages' results.
#[derive(Debug, Default)]
pub struct SharedStageContext {
    bases: DashMap<String, Snapshot>,
    finals: DashMap<String, Snapshot>,
}

impl SharedStageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_base(&self, stage_id: &str, snapshot: Snapshot) {
        self.bases.insert(stage_id.to_string(), snapshot);
    }

    pub fn base(&self, stage_id: &str) -> Option<Snapshot> {
        self.bases.get(stage_id).map(|s| *s)
    }

    pub fn record_final(&self, stage_id: &str, snapshot: Snapshot) {
        self.finals.insert(stage_id.to_string(), snapshot);
    }

    pub fn final_snapshot(&self, stage_id: &str) -> Option<Snapshot> {
        self.finals.get(stage_id).map(|s| *s)
    }
}

#[derive(Clone, Default)]
struct ContextState {
    environment: Environment,
    working_directory: Option<String>,
    user: Option<User>,
    image_config: ImageConfig,
    snapshots: HashMap<String, Snapshot>,
    latest_snapshot: Option<Snapshot>,
    /// Environment, working directory, and user as of the last group
    /// boundary. Parallel siblings mutate the live fields in unspecified
    /// order; keying and command execution read this stable copy instead.
    group_state: Option<GroupState>,
}

#[derive(Clone, Default)]
struct GroupState {
    environment: Environment,
    working_directory: Option<String>,
    user: Option<User>,
}

/// Mutable execution state for one (stage, platform) pair.
///
/// Mutators take the interior lock for small, non-blocking critical
/// sections; handles to collaborators (reporter, cache, snapshotter, shared
/// stage context, cancellation) are clonable and lock-free to access.
pub struct ExecutionContext {
    stage_id: String,
    platform: Platform,
    reporter: Reporter,
    cache: Arc<dyn BuildCache>,
    snapshotter: Arc<dyn Snapshotter>,
    stages: Arc<SharedStageContext>,
    /// Rendered stage reference (`builder`, `0`, `previous`) to stage id, as
    /// resolved by the dependency analyzer for this stage.
    stage_refs: Arc<HashMap<String, String>>,
    cancellation: Arc<CancellationFlag>,
    state: Mutex<ContextState>,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stage_id: impl Into<String>,
        platform: Platform,
        reporter: Reporter,
        cache: Arc<dyn BuildCache>,
        snapshotter: Arc<dyn Snapshotter>,
        stages: Arc<SharedStageContext>,
        stage_refs: Arc<HashMap<String, String>>,
        cancellation: Arc<CancellationFlag>,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            platform,
            reporter,
            cache,
            snapshotter,
            stages,
            stage_refs,
            cancellation,
            state: Mutex::new(ContextState::default()),
        }
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn cache(&self) -> &Arc<dyn BuildCache> {
        &self.cache
    }

    pub fn snapshotter(&self) -> &Arc<dyn Snapshotter> {
        &self.snapshotter
    }

    pub fn stages(&self) -> &Arc<SharedStageContext> {
        &self.stages
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolve a rendered stage reference to a stage id.
    pub fn resolve_stage_ref(&self, reference: &str) -> Option<&str> {
        self.stage_refs.get(reference).map(String::as_str)
    }

    pub fn environment(&self) -> Environment {
        self.state.lock().environment.clone()
    }

    pub fn set_environment_variable(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.lock().environment.set(key, value);
    }

    pub fn merge_environment(&self, other: &Environment) {
        self.state.lock().environment.merge(other);
    }

    pub fn working_directory(&self) -> Option<String> {
        self.state.lock().working_directory.clone()
    }

    pub fn set_working_directory(&self, dir: impl Into<String>) {
        self.state.lock().working_directory = Some(dir.into());
    }

    pub fn user(&self) -> Option<User> {
        self.state.lock().user.clone()
    }

    pub fn set_user(&self, user: User) {
        self.state.lock().user = Some(user);
    }

    pub fn image_config(&self) -> ImageConfig {
        self.state.lock().image_config.clone()
    }

    /// Apply a metadata action to the image config, mirroring environment,
    /// working directory, and user into the context state.
    pub fn apply_metadata(&self, action: &MetadataAction) {
        let mut state = self.state.lock();
        state.image_config.apply(action);
        match action {
            MetadataAction::Env { key, value } => {
                state.environment.set(key.clone(), value.clone());
            }
            MetadataAction::WorkingDirectory(dir) => {
                state.working_directory = Some(dir.clone());
            }
            MetadataAction::User(user) => state.user = Some(user.clone()),
            _ => {}
        }
    }

    /// Seed the stage's starting snapshot (its base image) and pin the
    /// starting group state.
    pub fn seed_base_snapshot(&self, snapshot: Snapshot) {
        let mut state = self.state.lock();
        state.latest_snapshot = Some(snapshot);
        state.group_state = Some(GroupState {
            environment: state.environment.clone(),
            working_directory: state.working_directory.clone(),
            user: state.user.clone(),
        });
    }

    /// Record a node's snapshot. The context's latest snapshot advances
    /// separately, at group boundaries, so parallel siblings observe one
    /// stable predecessor state regardless of completion order.
    pub fn record_snapshot(&self, node_id: &str, snapshot: Snapshot) {
        self.state.lock().snapshots.insert(node_id.to_string(), snapshot);
    }

    /// Close a parallelizable group: optionally advance the stage's current
    /// snapshot and re-pin the group state to the accumulated values.
    pub fn advance_group(&self, snapshot: Option<Snapshot>) {
        let mut state = self.state.lock();
        if let Some(snapshot) = snapshot {
            state.latest_snapshot = Some(snapshot);
        }
        state.group_state = Some(GroupState {
            environment: state.environment.clone(),
            working_directory: state.working_directory.clone(),
            user: state.user.clone(),
        });
    }

    /// The environment as of the last group boundary; outside scheduled
    /// execution it falls back to the live environment.
    pub fn group_environment(&self) -> Environment {
        let state = self.state.lock();
        match &state.group_state {
            Some(group) => group.environment.clone(),
            None => state.environment.clone(),
        }
    }

    /// The working directory as of the last group boundary.
    pub fn group_working_directory(&self) -> Option<String> {
        let state = self.state.lock();
        match &state.group_state {
            Some(group) => group.working_directory.clone(),
            None => state.working_directory.clone(),
        }
    }

    /// The user as of the last group boundary.
    pub fn group_user(&self) -> Option<User> {
        let state = self.state.lock();
        match &state.group_state {
            Some(group) => group.user.clone(),
            None => state.user.clone(),
        }
    }

    pub fn snapshot_for(&self, node_id: &str) -> Option<Snapshot> {
        self.state.lock().snapshots.get(node_id).copied()
    }

    /// The most recent snapshot visible in this context.
    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.state.lock().latest_snapshot
    }

    /// Fork a context for a nested stage: environment and image config are
    /// carried over, snapshots are not.
    pub fn child_context(&self, stage_id: impl Into<String>) -> ExecutionContext {
        let state = self.state.lock();
        let child_state = ContextState {
            environment: state.environment.clone(),
            working_directory: state.working_directory.clone(),
            user: state.user.clone(),
            image_config: state.image_config.clone(),
            snapshots: HashMap::new(),
            latest_snapshot: None,
            group_state: None,
        };
        drop(state);
        ExecutionContext {
            stage_id: stage_id.into(),
            platform: self.platform.clone(),
            reporter: self.reporter.clone(),
            cache: Arc::clone(&self.cache),
            snapshotter: Arc::clone(&self.snapshotter),
            stages: Arc::clone(&self.stages),
            stage_refs: Arc::clone(&self.stage_refs),
            cancellation: Arc::clone(&self.cancellation),
            state: Mutex::new(child_state),
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("stage_id", &self.stage_id)
            .field("platform", &self.platform)
            .finish()
    }
}
