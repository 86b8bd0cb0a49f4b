//! Task graph for dependency-gated execution.
//!
//! `TaskGraph` holds every node of a run as a directed acyclic graph.
//! Edges point from a predecessor to the node it unblocks. Nodes are
//! never removed: failed and superseded nodes stay in the graph for audit,
//! and all retry or repair is expressed by inserting new nodes and
//! rewiring edges.

use crate::core::task::{NodeSpec, TaskId, TaskNode, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Graph shared between the control loop and observers.
///
/// Every claim, completion and insertion takes the write lock, which
/// makes each of them a single critical section.
pub type SharedGraph = Arc<RwLock<TaskGraph>>;

/// Wrap a graph for shared access.
pub fn shared(graph: TaskGraph) -> SharedGraph {
    Arc::new(RwLock::new(graph))
}

/// Where a freshly inserted node goes.
///
/// The new node depends on `from`; every node in `to` stops depending on
/// `from` and depends on the new node instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reroute {
    pub from: TaskId,
    pub to: Vec<TaskId>,
}

impl Reroute {
    pub fn new(from: TaskId, to: Vec<TaskId>) -> Self {
        Self { from, to }
    }

    pub fn single(from: TaskId, to: TaskId) -> Self {
        Self { from, to: vec![to] }
    }
}

/// Serializable image of a graph, written next to the run metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub next_id: u64,
    pub nodes: Vec<TaskNode>,
}

/// Per-status node counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
}

/// The pipeline's task graph.
pub struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    index: HashMap<TaskId, NodeIndex>,
    next_id: u64,
}

impl TaskGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            next_id: 1,
        }
    }

    fn node_index(&self, id: &TaskId) -> Result<NodeIndex> {
        self.index.get(id).copied().ok_or(Error::TaskNotFound(*id))
    }

    fn allocate_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Fails if `node` already reaches `dep`, i.e. adding `dep -> node`
    /// would close a cycle.
    fn check_edge(&self, dep: NodeIndex, node: NodeIndex) -> Result<()> {
        if dep == node || has_path_connecting(&self.graph, node, dep, None) {
            return Err(Error::Cycle {
                from: self.graph[dep].id,
                to: self.graph[node].id,
            });
        }
        Ok(())
    }

    fn require_pending(&self, idx: NodeIndex, to: &str) -> Result<()> {
        let node = &self.graph[idx];
        if !node.is_pending() {
            return Err(Error::InvalidTransition {
                id: node.id,
                from: node.status.label().to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    /// Add a node that waits on `blocked_by`.
    ///
    /// # Errors
    /// `TaskNotFound` for an unknown dependency, `Cycle` if the edge set
    /// would loop back to the new node.
    pub fn add_node(&mut self, spec: NodeSpec, blocked_by: &[TaskId]) -> Result<TaskId> {
        let deps = blocked_by
            .iter()
            .map(|dep| self.node_index(dep))
            .collect::<Result<Vec<_>>>()?;

        let id = self.allocate_id();
        let deps_set: BTreeSet<TaskId> = blocked_by.iter().copied().collect();
        let idx = self
            .graph
            .add_node(TaskNode::from_spec(id, spec, deps_set));
        self.index.insert(id, idx);

        for dep in deps {
            // A fresh node has no outgoing edges, so this cannot fail; it is
            // kept so that every edge goes through the same check.
            if let Err(err) = self.check_edge(dep, idx) {
                self.graph.remove_node(idx);
                self.index.remove(&id);
                return Err(err);
            }
            self.graph.update_edge(dep, idx, ());
        }

        tracing::debug!(task = %id, deps = blocked_by.len(), "node added");
        Ok(id)
    }

    /// Make the pending node `node` additionally wait on `on`.
    pub fn add_dependency(&mut self, node: &TaskId, on: &TaskId) -> Result<()> {
        let node_idx = self.node_index(node)?;
        let on_idx = self.node_index(on)?;
        self.require_pending(node_idx, "rewired")?;
        self.check_edge(on_idx, node_idx)?;

        self.graph.update_edge(on_idx, node_idx, ());
        self.graph[node_idx].blocked_by.insert(*on);
        Ok(())
    }

    /// Replace `node`'s dependency on `old` with a dependency on `new`.
    ///
    /// # Errors
    /// Fails without mutating when `node` is not pending, does not depend
    /// on `old`, or the new edge would create a cycle.
    pub fn rewire(&mut self, node: &TaskId, old: &TaskId, new: &TaskId) -> Result<()> {
        let node_idx = self.node_index(node)?;
        let old_idx = self.node_index(old)?;
        let new_idx = self.node_index(new)?;
        self.require_pending(node_idx, "rewired")?;

        let edge = self.graph.find_edge(old_idx, node_idx).ok_or_else(|| {
            Error::InvariantViolation(format!("{} does not depend on {}", node, old))
        })?;
        // Check against the graph without the edge being replaced.
        self.graph.remove_edge(edge);
        if let Err(err) = self.check_edge(new_idx, node_idx) {
            self.graph.add_edge(old_idx, node_idx, ());
            return Err(err);
        }
        self.graph.update_edge(new_idx, node_idx, ());

        let deps = &mut self.graph[node_idx].blocked_by;
        deps.remove(old);
        deps.insert(*new);
        tracing::debug!(task = %node, old = %old, new = %new, "dependency rewired");
        Ok(())
    }

    /// Insert a node behind `reroute.from` and move every `reroute.to`
    /// node behind it.
    ///
    /// All preconditions are checked before anything is mutated, so a
    /// failure leaves the graph unchanged.
    pub fn insert_and_rewire(&mut self, spec: NodeSpec, reroute: Reroute) -> Result<TaskId> {
        let from_idx = self.node_index(&reroute.from)?;
        // A repeated target would pass every check and then fail its
        // second rewire half way through.
        let targets: BTreeSet<TaskId> = reroute.to.iter().copied().collect();
        for target in &targets {
            let idx = self.node_index(target)?;
            self.require_pending(idx, "rewired")?;
            if self.graph.find_edge(from_idx, idx).is_none() {
                return Err(Error::InvariantViolation(format!(
                    "{} does not depend on {}",
                    target, reroute.from
                )));
            }
            // The new node inherits `from`'s position, so a target that
            // reaches `from` would loop through it.
            if has_path_connecting(&self.graph, idx, from_idx, None) {
                return Err(Error::Cycle {
                    from: reroute.from,
                    to: *target,
                });
            }
        }

        let new_id = self.add_node(spec, &[reroute.from])?;
        for target in &targets {
            self.rewire(target, &reroute.from, &new_id)?;
        }
        tracing::debug!(
            task = %new_id,
            from = %reroute.from,
            rerouted = targets.len(),
            "node inserted and rewired"
        );
        Ok(new_id)
    }

    /// Replace a blocked node with a fresh one.
    ///
    /// The replacement waits on the blocked node's predecessors and takes
    /// over its dependents. The blocked node itself is left untouched.
    pub fn supersede(&mut self, blocked: &TaskId, spec: NodeSpec) -> Result<TaskId> {
        let idx = self.node_index(blocked)?;
        let node = &self.graph[idx];
        if !node.is_blocked() {
            return Err(Error::InvalidTransition {
                id: *blocked,
                from: node.status.label().to_string(),
                to: "superseded".to_string(),
            });
        }
        let deps: Vec<TaskId> = node.blocked_by.iter().copied().collect();
        let dependents = self.dependents(blocked);
        for dependent in &dependents {
            let dep_idx = self.node_index(dependent)?;
            self.require_pending(dep_idx, "rewired")?;
        }

        let new_id = self.add_node(spec.with_meta("supersedes", blocked.to_string()), &deps)?;
        for dependent in &dependents {
            self.rewire(dependent, blocked, &new_id)?;
        }
        tracing::debug!(task = %new_id, superseded = %blocked, "node superseded");
        Ok(new_id)
    }

    /// Claim the oldest runnable node.
    ///
    /// A node is runnable when it is pending and every predecessor is
    /// completed. The claimed node moves to `in_progress`.
    pub fn claim_next(&mut self) -> Option<TaskId> {
        let idx = self
            .graph
            .node_indices()
            .filter(|&idx| self.is_runnable(idx))
            .min_by_key(|&idx| self.graph[idx].id)?;
        let node = &mut self.graph[idx];
        node.start();
        tracing::debug!(task = %node.id, kind = %node.kind.label(), "node claimed");
        Some(node.id)
    }

    fn is_runnable(&self, idx: NodeIndex) -> bool {
        self.graph[idx].is_pending()
            && self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .all(|dep| self.graph[dep].is_completed())
    }

    /// Ids of every runnable node, oldest first, without claiming them.
    pub fn runnable(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter(|&idx| self.is_runnable(idx))
            .map(|idx| self.graph[idx].id)
            .collect();
        ids.sort();
        ids
    }

    /// Mark an in-progress node completed, merging `metadata` into it.
    ///
    /// # Errors
    /// `InvalidTransition` unless the node is `in_progress`.
    pub fn complete(
        &mut self,
        id: &TaskId,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        let idx = self.node_index(id)?;
        let node = &mut self.graph[idx];
        if node.status != TaskStatus::InProgress {
            return Err(Error::InvalidTransition {
                id: *id,
                from: node.status.label().to_string(),
                to: "completed".to_string(),
            });
        }
        node.complete(metadata);
        tracing::debug!(task = %id, "node completed");
        Ok(())
    }

    /// Mark a pending or in-progress node blocked.
    pub fn block(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        let idx = self.node_index(id)?;
        let node = &mut self.graph[idx];
        match node.status {
            TaskStatus::Pending | TaskStatus::InProgress => {
                node.block(reason);
                tracing::debug!(task = %id, reason, "node blocked");
                Ok(())
            }
            _ => Err(Error::InvalidTransition {
                id: *id,
                from: node.status.label().to_string(),
                to: "blocked".to_string(),
            }),
        }
    }

    /// Merge metadata into a node without changing its status.
    pub fn annotate(&mut self, id: &TaskId, key: &str, value: serde_json::Value) -> Result<()> {
        let idx = self.node_index(id)?;
        self.graph[idx].metadata.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// All nodes in creation order.
    pub fn nodes(&self) -> Vec<&TaskNode> {
        let mut nodes: Vec<&TaskNode> = self.graph.node_weights().collect();
        nodes.sort_by_key(|node| node.id);
        nodes
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Direct predecessors of `id`, oldest first.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Nodes that directly wait on `id`, oldest first.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].id)
            .collect();
        ids.sort();
        ids
    }

    pub fn has_dependency(&self, node: &TaskId, on: &TaskId) -> bool {
        match (self.index.get(on), self.index.get(node)) {
            (Some(&from), Some(&to)) => self.graph.find_edge(from, to).is_some(),
            _ => false,
        }
    }

    /// True when `to` can be reached from `from` along dependency edges.
    pub fn reaches(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for node in self.graph.node_weights() {
            match node.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Blocked { .. } => counts.blocked += 1,
            }
        }
        counts
    }

    /// Nodes in an order where every node follows its predecessors.
    pub fn topological_order(&self) -> Result<Vec<&TaskNode>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self.graph[cycle.node_id()].id;
            Error::InvariantViolation(format!("cycle detected at {}", id))
        })?;
        Ok(sorted.into_iter().map(|idx| &self.graph[idx]).collect())
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            next_id: self.next_id,
            nodes: self.nodes().into_iter().cloned().collect(),
        }
    }

    /// Rebuild a graph from a snapshot, re-deriving edges from each
    /// node's `blocked_by` set.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        let mut graph = Self::new();
        let mut nodes = snapshot.nodes;
        nodes.sort_by_key(|node| node.id);
        for node in &nodes {
            let id = node.id;
            let idx = graph.graph.add_node(node.clone());
            graph.index.insert(id, idx);
        }
        for node in &nodes {
            let to = graph.node_index(&node.id)?;
            for dep in &node.blocked_by {
                let from = graph.node_index(dep)?;
                graph.graph.update_edge(from, to, ());
            }
        }
        if !graph.is_acyclic() {
            return Err(Error::InvariantViolation(
                "graph snapshot contains a cycle".to_string(),
            ));
        }
        let max_id = nodes.iter().map(|n| n.id.0).max().unwrap_or(0);
        graph.next_id = snapshot.next_id.max(max_id + 1);
        Ok(graph)
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.len())
            .field("edges", &self.edge_count())
            .finish()
    }
}
