// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The build graph IR: stages, nodes, operations, platforms, dependencies.
//!
//! A [`BuildGraph`] is constructed once by a front-end (out of scope here)
//! and is read-only for the duration of a build. Stages hold an ordered list
//! of nodes; node dependencies stay within the stage, and cross-stage
//! dataflow goes through stage snapshots only (`COPY --from`).

pub mod environment;
pub mod operation;

pub use environment::{Environment, User};
pub use operation::{
    Command, ExecOperation, FileOwnership, FilesystemAction, FilesystemOperation,
    FilesystemSource, HealthcheckConfig, ImageOperation, ImageSource, MetadataAction,
    MetadataOperation, Mount, Operation, OperationKind, OperationMetadata, RetryPolicy,
    SourceLocation, StageRef,
};

use crate::error::{Error, Result};
use crate::platform::Platform;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Node-level execution constraints checked at dispatch time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConstraints {
    /// The node must run under a privileged executor.
    #[serde(default)]
    pub requires_privileged: bool,
    /// Minimum memory, in bytes, the executor must provide.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub memory_limit: Option<u64>,
    /// The node may only run on this platform.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub requires_platform: Option<Platform>,
}

/// One operation inside a stage, with its intra-stage dependencies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildNode {
    pub id: String,
    pub operation: Operation,
    /// Ids of nodes in the same stage that must complete first.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub constraints: NodeConstraints,
}

impl BuildNode {
    pub fn new(id: impl Into<String>, operation: Operation) -> Self {
        Self {
            id: id.into(),
            operation,
            dependencies: BTreeSet::new(),
            constraints: NodeConstraints::default(),
        }
    }

    #[must_use]
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    #[must_use]
    pub fn with_dependencies<S: Into<String>>(
        mut self,
        dependencies: impl IntoIterator<Item = S>,
    ) -> Self {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_constraints(mut self, constraints: NodeConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

/// A named unit of a multi-step build whose final filesystem state is itself
/// an artifact other stages may reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildStage {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    /// The starting filesystem state; always an image operation.
    pub base: Operation,
    #[serde(default)]
    pub nodes: Vec<BuildNode>,
}

impl BuildStage {
    pub fn new(id: impl Into<String>, base: Operation) -> Self {
        Self {
            id: id.into(),
            name: None,
            base,
            nodes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_node(mut self, node: BuildNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_node(&mut self, node: BuildNode) {
        self.nodes.push(node);
    }

    /// The stage's display name: its explicit name, or its id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn node(&self, id: &str) -> Option<&BuildNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// The immutable multi-stage, multi-platform build graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildGraph {
    pub stages: Vec<BuildStage>,
    /// The stage whose snapshot becomes the build artifact. Defaults to the
    /// last stage.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_stage: Option<String>,
    pub target_platforms: BTreeSet<Platform>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_stage(mut self, stage: BuildStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn add_stage(&mut self, stage: BuildStage) {
        self.stages.push(stage);
    }

    #[must_use]
    pub fn with_target_stage(mut self, target: impl Into<String>) -> Self {
        self.target_stage = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.target_platforms.insert(platform);
        self
    }

    /// Look up a stage by name or id.
    pub fn stage(&self, name_or_id: &str) -> Option<&BuildStage> {
        self.stages
            .iter()
            .find(|s| s.id == name_or_id || s.name.as_deref() == Some(name_or_id))
    }

    /// Zero-based position of a stage by id.
    pub fn stage_position(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id)
    }

    /// The target stage: the designated one, or the last stage.
    pub fn resolve_target(&self) -> Result<&BuildStage> {
        match &self.target_stage {
            Some(target) => self
                .stage(target)
                .ok_or_else(|| Error::StageNotFound(target.clone())),
            None => self
                .stages
                .last()
                .ok_or_else(|| Error::InvalidGraph("build graph has no stages".to_string())),
        }
    }

    /// Total number of operations (bases plus nodes) across all stages.
    pub fn operation_count(&self) -> usize {
        self.stages.iter().map(|s| 1 + s.nodes.len()).sum()
    }

    /// Pre-flight structural checks: at least one stage and one platform,
    /// unique stage ids and names, image bases, unique node ids per stage,
    /// and intra-stage dependencies that reference existing nodes.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::InvalidGraph("build graph has no stages".to_string()));
        }
        if self.target_platforms.is_empty() {
            return Err(Error::InvalidGraph(
                "build graph has no target platforms".to_string(),
            ));
        }

        let mut stage_keys = HashSet::new();
        for stage in &self.stages {
            if !stage_keys.insert(stage.id.as_str()) {
                return Err(Error::InvalidGraph(format!(
                    "duplicate stage id '{}'",
                    stage.id
                )));
            }
            if let Some(name) = stage.name.as_deref() {
                if name != stage.id && !stage_keys.insert(name) {
                    return Err(Error::InvalidGraph(format!(
                        "duplicate stage name '{name}'"
                    )));
                }
            }
            if stage.base.kind() != OperationKind::Image {
                return Err(Error::InvalidGraph(format!(
                    "stage '{}' base must be an image operation",
                    stage.id
                )));
            }

            let mut node_ids = HashSet::new();
            for node in &stage.nodes {
                if !node_ids.insert(node.id.as_str()) {
                    return Err(Error::InvalidGraph(format!(
                        "duplicate node id '{}' in stage '{}'",
                        node.id, stage.id
                    )));
                }
            }
            for node in &stage.nodes {
                for dependency in &node.dependencies {
                    if !node_ids.contains(dependency.as_str()) {
                        return Err(Error::InvalidGraph(format!(
                            "node '{}' in stage '{}' depends on unknown node '{}'",
                            node.id, stage.id, dependency
                        )));
                    }
                }
            }
        }

        if let Some(target) = &self.target_stage {
            if self.stage(target).is_none() {
                return Err(Error::StageNotFound(target.clone()));
            }
        }
        Ok(())
    }
}
