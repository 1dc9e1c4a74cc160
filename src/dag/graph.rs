// src/dag/graph.rs

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::dag::cycles::find_cycles;
use crate::dag::node::{DependencyNode, NodeStatus};
use crate::errors::{IngestError, Result};
use crate::types::{FailurePolicy, TaskId, TaskPayload};

/// Counts of nodes per status, for diagnostics and drain checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DagCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Pending nodes that belong to a reported cycle.
    pub cyclic: usize,
}

/// What [`DependencyDag::add_node`] did with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Inserted as a new `Pending` node (or a new lifecycle of a terminal id).
    Inserted,
    /// Folded into the pending node with the same id.
    Merged,
    /// Parked until the in-flight node with the same id settles.
    Deferred,
}

/// Dependency graph deciding the safe execution order of tasks.
///
/// It is responsible for:
/// - tracking, per node, which dependencies are still outstanding
/// - handing out ready nodes in priority order (FIFO among equal priority)
/// - unblocking dependents the moment their last dependency completes
/// - detecting cycles lazily, only once nothing can make progress
///
/// Dependencies on ids that are not (yet) in the DAG stay outstanding until a
/// node with that id is added and completes, or until the id is acknowledged
/// through [`DependencyDag::mark_completed`].
#[derive(Debug, Default)]
pub struct DependencyDag {
    nodes: HashMap<TaskId, DependencyNode>,
    /// Unknown id -> nodes waiting on it.
    waiting_on_missing: HashMap<TaskId, BTreeSet<TaskId>>,
    /// Ids that completed and were pruned, or were acknowledged externally.
    committed: HashSet<TaskId>,
    cycles: Vec<Vec<TaskId>>,
    cyclic: HashSet<TaskId>,
    /// Newer payloads for ids that were `Processing` when resubmitted.
    superseding: HashMap<TaskId, DependencyNode>,
    next_seq: u64,
    failure_policy: FailurePolicy,
}

impl DependencyDag {
    pub fn new(failure_policy: FailurePolicy) -> Self {
        Self {
            failure_policy,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&DependencyNode> {
        self.nodes.get(id)
    }

    pub fn status_of(&self, id: &str) -> Option<NodeStatus> {
        self.nodes.get(id).map(|n| n.status)
    }

    /// Cyclic groups reported so far. Their members are never executed.
    pub fn cycles(&self) -> &[Vec<TaskId>] {
        &self.cycles
    }

    /// Nodes without declared dependencies.
    pub fn roots(&self) -> Vec<&str> {
        let mut roots: Vec<&DependencyNode> = self
            .nodes
            .values()
            .filter(|n| n.dependencies.is_empty())
            .collect();
        roots.sort_by_key(|n| n.seq);
        roots.into_iter().map(DependencyNode::id).collect()
    }

    /// Nodes nothing depends on.
    pub fn leaves(&self) -> Vec<&str> {
        let mut leaves: Vec<&DependencyNode> = self
            .nodes
            .values()
            .filter(|n| n.dependents.is_empty())
            .collect();
        leaves.sort_by_key(|n| n.seq);
        leaves.into_iter().map(DependencyNode::id).collect()
    }

    /// Insert a node.
    ///
    /// - A new id is inserted as `Pending`.
    /// - An id whose previous node is terminal starts a new lifecycle.
    /// - An id that is still `Pending` gets the newer payload and the union of
    ///   both dependency sets.
    /// - An id that is `Processing` is parked as a superseding node. It starts
    ///   a new lifecycle once the in-flight run completes or fails.
    pub fn add_node(&mut self, mut node: DependencyNode) -> Admission {
        let id = node.task.id.clone();

        if let Some(existing) = self.nodes.get_mut(&id) {
            match existing.status {
                NodeStatus::Processing => {
                    debug!(node = %id, "node is in flight; deferring newer payload");
                    match self.superseding.remove(&id) {
                        Some(mut parked) => {
                            parked.task = node.task;
                            parked.dependencies.extend(node.dependencies);
                            self.superseding.insert(id, parked);
                        }
                        None => {
                            self.superseding.insert(id, node);
                        }
                    }
                    return Admission::Deferred;
                }
                NodeStatus::Pending => {
                    debug!(node = %id, "merging resubmitted pending node");
                    self.merge_pending(&id, node);
                    return Admission::Merged;
                }
                NodeStatus::Completed | NodeStatus::Failed => {
                    debug!(node = %id, "re-adding terminal node as a new lifecycle");
                    node.dependents = std::mem::take(&mut existing.dependents);
                    self.nodes.remove(&id);
                }
            }
        }

        node.seq = self.next_seq;
        self.next_seq += 1;
        node.status = NodeStatus::Pending;
        node.outstanding.clear();

        // Pending nodes that were waiting for this id before it existed.
        if let Some(waiters) = self.waiting_on_missing.remove(&id) {
            node.dependents.extend(waiters);
        }

        let deps: Vec<TaskId> = node.dependencies.iter().cloned().collect();
        self.nodes.insert(id.clone(), node);

        for dep in deps {
            self.link_dependency(&id, dep);
        }

        Admission::Inserted
    }

    /// Number of in-flight ids with a newer payload waiting behind them.
    pub fn superseded_len(&self) -> usize {
        self.superseding.len()
    }

    /// Replace the payload of pending node `id` and add the new dependencies.
    fn merge_pending(&mut self, id: &str, node: DependencyNode) {
        let Some(existing) = self.nodes.get_mut(id) else {
            return;
        };
        let added: Vec<TaskId> = node
            .dependencies
            .difference(&existing.dependencies)
            .cloned()
            .collect();
        existing.task = node.task;
        existing.dependencies.extend(added.iter().cloned());
        for dep in added {
            self.link_dependency(id, dep);
        }
    }

    /// Start the lifecycle of a payload that was parked behind the run of `id`.
    fn resume_superseding(&mut self, id: &str) -> bool {
        match self.superseding.remove(id) {
            Some(parked) => {
                info!(node = %id, "in-flight run settled; scheduling superseding payload");
                self.add_node(parked);
                true
            }
            None => false,
        }
    }

    /// Record that `id` depends on `dep`, updating outstanding/dependent sets.
    fn link_dependency(&mut self, id: &str, dep: TaskId) {
        let satisfied = match self.nodes.get_mut(&dep) {
            Some(dep_node) => {
                dep_node.dependents.insert(id.to_string());
                dep_node.status == NodeStatus::Completed
            }
            None if self.committed.contains(&dep) => true,
            None => {
                self.waiting_on_missing
                    .entry(dep.clone())
                    .or_default()
                    .insert(id.to_string());
                false
            }
        };

        if !satisfied {
            if let Some(node) = self.nodes.get_mut(id) {
                node.outstanding.insert(dep);
            }
        }
    }

    /// Pending nodes whose dependencies are all completed, highest priority
    /// first, insertion order among equal priorities.
    pub fn get_ready_nodes(&self) -> Vec<&DependencyNode> {
        let mut ready: Vec<&DependencyNode> = self
            .nodes
            .values()
            .filter(|n| n.is_ready() && !self.cyclic.contains(n.id()))
            .collect();
        ready.sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.seq.cmp(&b.seq)));
        ready
    }

    /// Move up to `limit` ready nodes to `Processing` and return their tasks.
    pub fn start_ready(&mut self, limit: Option<usize>) -> Vec<TaskPayload> {
        let ids: Vec<TaskId> = self
            .get_ready_nodes()
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|n| n.task.id.clone())
            .collect();

        let mut started = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.status = NodeStatus::Processing;
                debug!(node = %id, priority = node.priority(), "dependencies satisfied; marking Processing");
                started.push(node.task.clone());
            }
        }
        started
    }

    /// Move a single node to `Processing`, enforcing the ordering invariant.
    pub fn mark_processing(&mut self, id: &str) -> Result<()> {
        let cyclic = self.cyclic.contains(id);
        let node = self.nodes.get_mut(id).ok_or_else(|| {
            IngestError::ingestion("UNKNOWN_NODE", format!("node {id} is not in the DAG"))
        })?;

        if cyclic || !node.is_ready() {
            return Err(IngestError::ingestion(
                "NODE_NOT_READY",
                format!("node {id} is not ready (status {:?})", node.status),
            ));
        }

        node.status = NodeStatus::Processing;
        Ok(())
    }

    /// Mark `id` as completed and return the dependents that just became
    /// ready, in priority order.
    ///
    /// Completing an id that is not in the DAG acknowledges it as already
    /// committed, which unblocks nodes that referenced it.
    pub fn mark_completed(&mut self, id: &str) -> Vec<TaskId> {
        let dependents: Vec<TaskId> = match self.nodes.get_mut(id) {
            Some(node) => {
                if node.status == NodeStatus::Completed {
                    return Vec::new();
                }
                if !node.outstanding.is_empty() {
                    warn!(node = %id, "completing a node that still had outstanding dependencies");
                }
                node.status = NodeStatus::Completed;
                node.dependents.iter().cloned().collect()
            }
            None => {
                debug!(node = %id, "acknowledging external id as committed");
                self.committed.insert(id.to_string());
                self.waiting_on_missing
                    .remove(id)
                    .map(|w| w.into_iter().collect())
                    .unwrap_or_default()
            }
        };

        let mut newly_ready: Vec<&DependencyNode> = Vec::new();
        for dep_id in &dependents {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.outstanding.remove(id);
            }
        }
        for dep_id in &dependents {
            if let Some(dep) = self.nodes.get(dep_id) {
                if dep.is_ready() && !self.cyclic.contains(dep_id) {
                    newly_ready.push(dep);
                }
            }
        }
        newly_ready.sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.seq.cmp(&b.seq)));
        let mut ready: Vec<TaskId> = newly_ready.into_iter().map(|n| n.task.id.clone()).collect();

        let resumed = self.resume_superseding(id);
        if resumed && self.nodes.get(id).is_some_and(DependencyNode::is_ready) {
            ready.push(id.to_string());
        }
        ready
    }

    /// Mark `id` as terminally failed.
    ///
    /// Under [`FailurePolicy::Isolate`] dependents stay pending. Under
    /// [`FailurePolicy::Propagate`] every pending dependent (transitively) is
    /// failed as well. Returns every id that was newly failed, including `id`.
    pub fn mark_failed(&mut self, id: &str) -> Vec<TaskId> {
        let Some(node) = self.nodes.get_mut(id) else {
            warn!(node = %id, "failure reported for unknown node; ignoring");
            return Vec::new();
        };
        node.status = NodeStatus::Failed;
        let mut newly_failed = vec![id.to_string()];

        if self.failure_policy == FailurePolicy::Propagate {
            let mut stack: Vec<TaskId> = node.dependents.iter().cloned().collect();
            while let Some(name) = stack.pop() {
                if let Some(info) = self.nodes.get_mut(&name) {
                    if info.status == NodeStatus::Pending {
                        info.status = NodeStatus::Failed;
                        debug!(node = %name, "marking dependent as Failed due to upstream failure");
                        newly_failed.push(name.clone());
                        stack.extend(info.dependents.iter().cloned());
                    }
                }
            }
        }

        // A newer payload gets its own attempt.
        self.resume_superseding(id);
        newly_failed
    }

    /// Put a failed or processing node back to `Pending` so it can be
    /// scheduled again. A parked superseding payload is folded in, since the
    /// older one never ran.
    pub fn reset_to_pending(&mut self, id: &str) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) if matches!(node.status, NodeStatus::Failed | NodeStatus::Processing) => {
                node.status = NodeStatus::Pending;
            }
            _ => return false,
        }
        if let Some(parked) = self.superseding.remove(id) {
            self.merge_pending(id, parked);
        }
        true
    }

    /// True when nothing is ready and nothing is in flight, yet some node is
    /// still pending.
    pub fn is_stalled(&self) -> bool {
        let mut any_pending = false;
        for node in self.nodes.values() {
            match node.status {
                NodeStatus::Processing => return false,
                NodeStatus::Pending if self.cyclic.contains(node.id()) => {}
                NodeStatus::Pending => {
                    if node.outstanding.is_empty() {
                        return false;
                    }
                    any_pending = true;
                }
                NodeStatus::Completed | NodeStatus::Failed => {}
            }
        }
        any_pending
    }

    /// Every cyclic group among non-terminal nodes, computed from scratch.
    pub fn detect_cycles(&self) -> Vec<Vec<TaskId>> {
        let live: Vec<&DependencyNode> = self
            .nodes
            .values()
            .filter(|n| !n.status.is_terminal())
            .collect();

        let edges = live.iter().flat_map(|n| {
            n.outstanding
                .iter()
                .filter(|dep| self.nodes.contains_key(*dep))
                .map(move |dep| (dep.as_str(), n.id()))
        });

        find_cycles(live.iter().map(|n| n.id()), edges)
    }

    /// Run cycle detection only if the DAG cannot make progress. Newly found
    /// cycles are recorded in [`DependencyDag::cycles`] and returned.
    pub fn check_progress(&mut self) -> Vec<Vec<TaskId>> {
        if !self.is_stalled() {
            return Vec::new();
        }

        let found: Vec<Vec<TaskId>> = self
            .detect_cycles()
            .into_iter()
            .filter(|group| !group.iter().all(|id| self.cyclic.contains(id)))
            .collect();

        for group in &found {
            warn!(members = ?group, "dependency cycle detected; members will not be executed");
            self.cyclic.extend(group.iter().cloned());
            self.cycles.push(group.clone());
        }

        found
    }

    /// Pending nodes that cannot make progress: members of cycles, nodes
    /// downstream of cycles or failures, and nodes waiting on unknown ids.
    pub fn blocked(&self) -> Vec<&str> {
        if !self.is_stalled() && self.cyclic.is_empty() {
            return Vec::new();
        }
        let mut blocked: Vec<&DependencyNode> = self
            .nodes
            .values()
            .filter(|n| {
                n.status == NodeStatus::Pending
                    && (self.cyclic.contains(n.id()) || !n.outstanding.is_empty())
            })
            .collect();
        blocked.sort_by_key(|n| n.seq);
        blocked.into_iter().map(DependencyNode::id).collect()
    }

    pub fn counts(&self) -> DagCounts {
        let mut counts = DagCounts::default();
        for node in self.nodes.values() {
            match node.status {
                NodeStatus::Pending if self.cyclic.contains(node.id()) => counts.cyclic += 1,
                NodeStatus::Pending => counts.pending += 1,
                NodeStatus::Processing => counts.processing += 1,
                NodeStatus::Completed => counts.completed += 1,
                NodeStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Nothing ready and nothing in flight: whatever is left is blocked.
    pub fn is_drained(&self) -> bool {
        let counts = self.counts();
        counts.processing == 0 && (counts.pending == 0 || self.is_stalled())
    }

    /// Drop completed nodes to bound memory. Their ids are remembered so that
    /// later nodes depending on them are immediately satisfied.
    pub fn prune_completed(&mut self) -> usize {
        let done: Vec<TaskId> = self
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Completed)
            .map(|n| n.task.id.clone())
            .collect();

        for id in &done {
            self.nodes.remove(id);
            self.committed.insert(id.clone());
        }

        if !done.is_empty() {
            info!(pruned = done.len(), "pruned completed DAG nodes");
        }
        done.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;
    use serde_json::Value;

    fn node(id: &str, priority: i32, deps: &[&str]) -> DependencyNode {
        let task = TaskPayload::new(id, TaskType::EntityUpsert, Value::Null).with_priority(priority);
        DependencyNode::new(task, deps.iter().copied())
    }

    fn ids(nodes: Vec<&DependencyNode>) -> Vec<&str> {
        nodes.into_iter().map(DependencyNode::id).collect()
    }

    #[test]
    fn ready_nodes_are_ordered_by_priority_then_insertion() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("low", 1, &[]));
        dag.add_node(node("high", 9, &[]));
        dag.add_node(node("low2", 1, &[]));
        dag.add_node(node("blocked", 100, &["low"]));

        assert_eq!(ids(dag.get_ready_nodes()), vec!["high", "low", "low2"]);
    }

    #[test]
    fn dependent_becomes_ready_when_last_dependency_completes() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("a", 0, &[]));
        dag.add_node(node("b", 0, &[]));
        dag.add_node(node("rel", 0, &["a", "b"]));

        let started = dag.start_ready(None);
        assert_eq!(started.len(), 2);

        assert!(dag.mark_completed("a").is_empty());
        assert_eq!(dag.mark_completed("b"), vec!["rel".to_string()]);
        assert_eq!(ids(dag.get_ready_nodes()), vec!["rel"]);
    }

    #[test]
    fn mark_processing_rejects_unready_node() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("a", 0, &[]));
        dag.add_node(node("b", 0, &["a"]));

        assert!(dag.mark_processing("b").is_err());
        dag.mark_processing("a").unwrap();
        dag.mark_completed("a");
        dag.mark_processing("b").unwrap();
    }

    #[test]
    fn failure_is_isolated_by_default() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("a", 0, &[]));
        dag.add_node(node("b", 0, &["a"]));
        dag.start_ready(None);

        assert_eq!(dag.mark_failed("a"), vec!["a".to_string()]);
        assert_eq!(dag.status_of("b"), Some(NodeStatus::Pending));
        assert!(dag.is_drained());
        assert_eq!(dag.blocked(), vec!["b"]);
    }

    #[test]
    fn failure_propagates_when_configured() {
        let mut dag = DependencyDag::new(FailurePolicy::Propagate);
        dag.add_node(node("a", 0, &[]));
        dag.add_node(node("b", 0, &["a"]));
        dag.add_node(node("c", 0, &["b"]));
        dag.start_ready(None);

        let mut failed = dag.mark_failed("a");
        failed.sort();
        assert_eq!(failed, vec!["a", "b", "c"]);
    }

    #[test]
    fn dependency_on_later_node_waits_for_it() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("rel", 0, &["late"]));
        assert!(dag.get_ready_nodes().is_empty());

        dag.add_node(node("late", 0, &[]));
        dag.start_ready(None);
        assert_eq!(dag.mark_completed("late"), vec!["rel".to_string()]);
    }

    #[test]
    fn external_acknowledgement_unblocks_waiters() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("rel", 0, &["already-in-graph"]));
        assert_eq!(dag.mark_completed("already-in-graph"), vec!["rel".to_string()]);
    }

    #[test]
    fn cycles_are_detected_only_when_stalled() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("x", 0, &["y"]));
        dag.add_node(node("y", 0, &["x"]));
        dag.add_node(node("free", 0, &[]));

        // `free` is ready, so nothing is stalled yet.
        assert!(dag.check_progress().is_empty());

        let started = dag.start_ready(None);
        assert_eq!(started.len(), 1);
        assert!(dag.check_progress().is_empty());
        dag.mark_completed("free");

        let cycles = dag.check_progress();
        assert_eq!(cycles, vec![vec!["x".to_string(), "y".to_string()]]);
        assert_eq!(dag.cycles().len(), 1);
        assert!(dag.start_ready(None).is_empty());
        assert!(dag.is_drained());
        assert_eq!(dag.counts().cyclic, 2);

        // Reported once.
        assert!(dag.check_progress().is_empty());
    }

    #[test]
    fn pending_resubmission_merges_dependencies() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("a", 0, &[]));
        dag.add_node(node("n", 0, &[]));
        dag.add_node(node("n", 5, &["a"]));

        let n = dag.get("n").expect("node n present");
        assert_eq!(n.priority(), 5);
        assert!(!n.is_ready());
        assert_eq!(dag.len(), 2);
    }

    #[test]
    fn resubmitted_in_flight_node_runs_again_after_completion() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("a", 0, &[]));
        assert_eq!(dag.start_ready(None).len(), 1);

        assert_eq!(dag.add_node(node("a", 7, &[])), Admission::Deferred);
        assert_eq!(dag.superseded_len(), 1);
        assert!(dag.start_ready(None).is_empty());
        assert!(!dag.is_drained());

        assert_eq!(dag.mark_completed("a"), vec!["a".to_string()]);
        assert_eq!(dag.superseded_len(), 0);
        let rerun = dag.start_ready(None);
        assert_eq!(rerun.len(), 1);
        assert_eq!(rerun[0].priority, 7);
    }

    #[test]
    fn superseding_payload_survives_a_failed_run() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("a", 0, &[]));
        dag.start_ready(None);
        dag.add_node(node("a", 3, &[]));

        assert_eq!(dag.mark_failed("a"), vec!["a".to_string()]);
        assert_eq!(dag.status_of("a"), Some(NodeStatus::Pending));
        assert_eq!(dag.start_ready(None)[0].priority, 3);
    }

    #[test]
    fn requeued_node_takes_the_superseding_payload() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("a", 0, &[]));
        dag.start_ready(None);
        dag.add_node(node("a", 4, &[]));

        assert!(dag.reset_to_pending("a"));
        assert_eq!(dag.superseded_len(), 0);
        assert_eq!(dag.start_ready(None)[0].priority, 4);
    }

    #[test]
    fn self_dependency_is_reported_as_a_cycle() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("loop", 0, &["loop"]));
        dag.add_node(node("free", 0, &[]));

        let started = dag.start_ready(None);
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].id, "free");
        dag.mark_completed("free");

        assert_eq!(dag.check_progress(), vec![vec!["loop".to_string()]]);
        assert!(dag.start_ready(None).is_empty());
        assert_eq!(dag.counts().cyclic, 1);
        assert!(dag.is_drained());
    }

    #[test]
    fn roots_and_leaves() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("a", 0, &[]));
        dag.add_node(node("b", 0, &["a"]));
        dag.add_node(node("c", 0, &["a"]));

        assert_eq!(dag.roots(), vec!["a"]);
        assert_eq!(dag.leaves(), vec!["b", "c"]);
    }

    #[test]
    fn pruned_ids_still_satisfy_new_dependents() {
        let mut dag = DependencyDag::default();
        dag.add_node(node("a", 0, &[]));
        dag.start_ready(None);
        dag.mark_completed("a");
        assert_eq!(dag.prune_completed(), 1);

        dag.add_node(node("b", 0, &["a"]));
        assert_eq!(ids(dag.get_ready_nodes()), vec!["b"]);
    }
}
