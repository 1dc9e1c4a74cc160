// src/dag/mod.rs

//! Dependency ordering for ingestion tasks.
//!
//! - [`node`] wraps a task with its dependency bookkeeping.
//! - [`graph`] holds the [`DependencyDag`] that hands out ready nodes.
//! - [`builder`] turns change fragments into nodes with the right edges.
//! - [`cycles`] finds cyclic groups with Tarjan's SCC algorithm.

pub mod builder;
pub mod cycles;
pub mod graph;
pub mod node;

pub use builder::{default_priority, embedding_task_id, parse_task_id, DagBuilder};
pub use cycles::find_cycles;
pub use graph::{Admission, DagCounts, DependencyDag};
pub use node::{DependencyNode, NodeStatus};
