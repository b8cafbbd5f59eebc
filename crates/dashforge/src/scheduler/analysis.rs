// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Build graph analysis: per-stage dependency graphs, cycle detection,
//! parallelizable groups, and cross-stage ordering.
//!
//! Analysis runs once, before any execution. A cycle anywhere - inside a
//! stage or among stages after `COPY --from` edges are resolved - fails the
//! build before a single operation starts.

use crate::error::{Error, Result};
use crate::graph::{BuildGraph, BuildStage, FilesystemSource, Operation, StageRef};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet};

/// A stage's node dependency graph. Edges run from a dependency to its
/// dependent.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph from a stage's nodes, in declaration order.
    pub fn from_stage(stage: &BuildStage) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        for node in &stage.nodes {
            let index = graph.add_node(node.id.clone());
            indices.insert(node.id.clone(), index);
        }
        for node in &stage.nodes {
            let to = indices[&node.id];
            for dependency in &node.dependencies {
                let from = *indices.get(dependency).ok_or_else(|| {
                    Error::InvalidGraph(format!(
                        "node '{}' depends on unknown node '{}'",
                        node.id, dependency
                    ))
                })?;
                graph.add_edge(from, to, ());
            }
        }
        Ok(Self { graph, indices })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.indices.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Number of direct dependents; used as the priority weight.
    pub fn dependent_count(&self, id: &str) -> usize {
        self.indices
            .get(id)
            .map(|&index| {
                self.graph
                    .neighbors_directed(index, Direction::Outgoing)
                    .count()
            })
            .unwrap_or(0)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<String> {
        match self.indices.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// DFS cycle detection with an explicit recursion stack. Returns the
    /// nodes of one cycle when present.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut stack: Vec<NodeIndex> = Vec::new();

        for start in self.graph.node_indices() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS; the `stack` mirrors the recursion stack.
            let mut work: Vec<(NodeIndex, bool)> = vec![(start, false)];
            while let Some((node, children_done)) = work.pop() {
                if children_done {
                    marks[node.index()] = Mark::Done;
                    stack.pop();
                    continue;
                }
                if marks[node.index()] == Mark::Done {
                    continue;
                }
                if marks[node.index()] == Mark::InProgress {
                    continue;
                }
                marks[node.index()] = Mark::InProgress;
                stack.push(node);
                work.push((node, true));
                for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                    match marks[next.index()] {
                        Mark::InProgress => {
                            // Back-edge: the cycle is the stack suffix from `next`.
                            let mut cycle: Vec<String> = stack
                                .iter()
                                .skip_while(|&&n| n != next)
                                .map(|&n| self.graph[n].clone())
                                .collect();
                            cycle.push(self.graph[next].clone());
                            return Some(cycle);
                        }
                        Mark::Unvisited => work.push((next, false)),
                        Mark::Done => {}
                    }
                }
            }
        }
        None
    }
}

/// The analysis of one stage: its dependency graph and its Kahn layers.
#[derive(Debug)]
pub struct StageAnalysis {
    pub stage_id: String,
    pub graph: DependencyGraph,
    /// Parallelizable groups, in execution order. Each group's nodes have
    /// all dependencies in earlier groups.
    pub groups: Vec<Vec<String>>,
    /// Ids of stages this stage reads via `COPY --from`.
    pub stage_dependencies: BTreeSet<String>,
    /// Rendered stage reference -> resolved stage id, for executor lookups.
    pub stage_refs: HashMap<String, String>,
}

/// The full pre-execution plan for a build graph.
#[derive(Debug)]
pub struct ParallelizationPlan {
    pub stages: HashMap<String, StageAnalysis>,
    /// Stages to execute, topologically ordered and restricted to the target
    /// stage's transitive dependency closure.
    pub order: Vec<String>,
    /// Bases plus nodes across the selected stages, for one platform.
    pub total_operations: usize,
}

impl ParallelizationPlan {
    pub fn analysis(&self, stage_id: &str) -> Result<&StageAnalysis> {
        self.stages.get(stage_id).ok_or_else(|| {
            Error::Internal(format!("missing stage analysis for '{stage_id}'"))
        })
    }
}

/// Computes [`ParallelizationPlan`]s.
pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    pub fn analyze(graph: &BuildGraph) -> Result<ParallelizationPlan> {
        graph.validate()?;

        let mut stages = HashMap::new();
        for (position, stage) in graph.stages.iter().enumerate() {
            let analysis = Self::analyze_stage(graph, stage, position)?;
            stages.insert(stage.id.clone(), analysis);
        }

        let target = graph.resolve_target()?.id.clone();
        let order = Self::stages_for_execution(&stages, &target)?;
        let total_operations = order
            .iter()
            .filter_map(|id| graph.stage(id))
            .map(|s| 1 + s.nodes.len())
            .sum();

        Ok(ParallelizationPlan {
            stages,
            order,
            total_operations,
        })
    }

    fn analyze_stage(
        graph: &BuildGraph,
        stage: &BuildStage,
        position: usize,
    ) -> Result<StageAnalysis> {
        let dep_graph = DependencyGraph::from_stage(stage)?;
        if let Some(cycle) = dep_graph.find_cycle() {
            return Err(Error::CyclicDependency(format!(
                "stage '{}': {}",
                stage.id,
                cycle.join(" -> ")
            )));
        }
        let groups = Self::kahn_layers(stage)?;

        let mut stage_dependencies = BTreeSet::new();
        let mut stage_refs = HashMap::new();
        for node in &stage.nodes {
            if let Operation::Filesystem(fs) = &node.operation {
                if let FilesystemSource::Stage { stage: reference, .. } = &fs.source {
                    let resolved = Self::resolve_stage_ref(graph, position, reference)?;
                    if resolved == stage.id {
                        return Err(Error::CyclicDependency(format!(
                            "stage '{}' copies from itself",
                            stage.id
                        )));
                    }
                    stage_refs.insert(reference.to_string(), resolved.clone());
                    stage_dependencies.insert(resolved);
                }
            }
        }

        Ok(StageAnalysis {
            stage_id: stage.id.clone(),
            graph: dep_graph,
            groups,
            stage_dependencies,
            stage_refs,
        })
    }

    /// Kahn layering: repeatedly emit the nodes whose dependencies are all
    /// processed, preserving declaration order within a layer.
    fn kahn_layers(stage: &BuildStage) -> Result<Vec<Vec<String>>> {
        let mut processed: HashSet<String> = HashSet::new();
        let mut groups = Vec::new();
        while processed.len() < stage.nodes.len() {
            let layer: Vec<String> = stage
                .nodes
                .iter()
                .filter(|node| {
                    !processed.contains(&node.id)
                        && node.dependencies.iter().all(|d| processed.contains(d))
                })
                .map(|node| node.id.clone())
                .collect();
            if layer.is_empty() {
                return Err(Error::CyclicDependency(format!(
                    "stage '{}' has no runnable nodes left",
                    stage.id
                )));
            }
            processed.extend(layer.iter().cloned());
            groups.push(layer);
        }
        Ok(groups)
    }

    /// Resolve a stage reference from the stage at `position`.
    fn resolve_stage_ref(
        graph: &BuildGraph,
        position: usize,
        reference: &StageRef,
    ) -> Result<String> {
        match reference {
            StageRef::Named(name) => graph
                .stage(name)
                .map(|s| s.id.clone())
                .ok_or_else(|| Error::StageNotFound(name.clone())),
            StageRef::Index(index) => graph
                .stages
                .get(*index)
                .map(|s| s.id.clone())
                .ok_or_else(|| Error::StageNotFound(index.to_string())),
            StageRef::Previous => {
                if position == 0 {
                    // `COPY --from: previous` in the first stage.
                    return Err(Error::StageNotFound("previous".to_string()));
                }
                Ok(graph.stages[position - 1].id.clone())
            }
        }
    }

    /// Topological order of the target stage's transitive dependency
    /// closure, dependencies first.
    fn stages_for_execution(
        analyses: &HashMap<String, StageAnalysis>,
        target: &str,
    ) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut done: HashSet<String> = HashSet::new();
        let mut visiting: HashSet<String> = HashSet::new();

        // Iterative post-order DFS over stage dependencies.
        let mut work: Vec<(String, bool)> = vec![(target.to_string(), false)];
        while let Some((stage_id, children_done)) = work.pop() {
            if children_done {
                visiting.remove(&stage_id);
                if done.insert(stage_id.clone()) {
                    order.push(stage_id);
                }
                continue;
            }
            if done.contains(&stage_id) {
                continue;
            }
            if !visiting.insert(stage_id.clone()) {
                return Err(Error::CyclicDependency(format!(
                    "stage dependency cycle through '{stage_id}'"
                )));
            }
            let analysis = analyses.get(&stage_id).ok_or_else(|| {
                Error::Internal(format!("missing stage analysis for '{stage_id}'"))
            })?;
            work.push((stage_id, true));
            for dependency in &analysis.stage_dependencies {
                if !done.contains(dependency) {
                    if visiting.contains(dependency) {
                        return Err(Error::CyclicDependency(format!(
                            "stage dependency cycle through '{dependency}'"
                        )));
                    }
                    work.push((dependency.clone(), false));
                }
            }
        }
        Ok(order)
    }
}
