// src/dag/node.rs

//! A task wrapped with its dependency bookkeeping.

use std::collections::{BTreeSet, HashSet};

use crate::types::{TaskId, TaskPayload};

/// Lifecycle of a node inside the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Waiting for dependencies, or ready but not yet handed out.
    Pending,
    /// Handed to the pool; every dependency was `Completed` at that moment.
    Processing,
    Completed,
    /// Retries exhausted (or failed by propagation).
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub task: TaskPayload,
    /// Every id this node was declared to depend on.
    pub dependencies: BTreeSet<TaskId>,
    /// Ids of nodes that declared a dependency on this one.
    pub dependents: BTreeSet<TaskId>,
    pub status: NodeStatus,
    /// Dependencies not yet completed. Empty means ready (when pending).
    pub(crate) outstanding: HashSet<TaskId>,
    /// Insertion order, used to break priority ties.
    pub(crate) seq: u64,
}

impl DependencyNode {
    pub fn new<I, S>(task: TaskPayload, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        // A self-dependency is kept; the DAG reports it as a one-node cycle.
        let dependencies: BTreeSet<TaskId> = dependencies.into_iter().map(Into::into).collect();
        Self {
            task,
            dependencies,
            dependents: BTreeSet::new(),
            status: NodeStatus::Pending,
            outstanding: HashSet::new(),
            seq: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn priority(&self) -> i32 {
        self.task.priority
    }

    /// Pending with no outstanding dependency.
    pub fn is_ready(&self) -> bool {
        self.status == NodeStatus::Pending && self.outstanding.is_empty()
    }

    /// Dependencies that have not completed yet.
    pub fn outstanding(&self) -> impl Iterator<Item = &str> {
        self.outstanding.iter().map(String::as_str)
    }
}
