// src/dag/builder.rs

//! Turn the fragments of one [`ChangeEvent`] into DAG nodes.
//!
//! Ordering rules:
//! - every fragment task depends on the event's `parse` task
//! - relationship upserts depend on their source/target entities and on
//!   their dependency hints
//! - entity removals depend on the removal of relationships referencing them
//! - embedding tasks depend on the upsert of their entity
//!
//! A reference is only turned into a dependency when the referenced element is
//! part of the same submission or is still live in the DAG (`is_live`).
//! Anything else is assumed to be committed already.

use std::collections::{BTreeSet, HashMap};

use serde_json::{json, Value};
use tracing::debug;

use crate::dag::node::DependencyNode;
use crate::errors::{IngestError, Result};
use crate::types::{
    ChangeEvent, ChangeFragment, FragmentData, FragmentOperation, TaskId, TaskPayload, TaskType,
};

/// Default priority per task type. Parse work unblocks everything else.
pub fn default_priority(task_type: TaskType) -> i32 {
    match task_type {
        TaskType::Parse => 100,
        TaskType::EntityUpsert => 50,
        TaskType::RelationshipUpsert => 40,
        TaskType::Embedding => 10,
    }
}

pub fn parse_task_id(event: &ChangeEvent) -> TaskId {
    format!("parse:{}", event.id)
}

pub fn embedding_task_id(entity_id: &str) -> TaskId {
    format!("{entity_id}#embedding")
}

/// Builds the nodes for one event submission.
#[derive(Debug, Clone, Copy)]
pub struct DagBuilder {
    max_retries: u32,
}

impl DagBuilder {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Build every node for `event` and its `fragments`, parse node first.
    pub fn build<F>(
        &self,
        event: &ChangeEvent,
        fragments: &[ChangeFragment],
        is_live: F,
    ) -> Result<Vec<DependencyNode>>
    where
        F: Fn(&str) -> bool,
    {
        for fragment in fragments {
            if !fragment.is_consistent() {
                return Err(IngestError::ingestion(
                    "INVALID_FRAGMENT",
                    format!(
                        "fragment {} declares {:?} but carries {:?} data",
                        fragment.id(),
                        fragment.change_type,
                        fragment.data.change_type()
                    ),
                ));
            }
        }

        let parse_id = parse_task_id(event);
        let parse_task = self.task(
            event,
            parse_id.clone(),
            TaskType::Parse,
            serde_json::to_value(event)?,
            1.0,
        );
        let mut nodes = vec![DependencyNode::new(parse_task, Vec::<TaskId>::new())];

        // Element id -> operation, for everything written by this submission.
        let submitted: HashMap<&str, FragmentOperation> = fragments
            .iter()
            .map(|f| (f.id(), f.operation))
            .collect();

        // Entity id -> relationship removals that reference it.
        let mut removals_referencing: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for fragment in fragments {
            if let (FragmentData::Relationship(rel), FragmentOperation::Remove) =
                (&fragment.data, fragment.operation)
            {
                for endpoint in [&rel.source, &rel.target] {
                    removals_referencing
                        .entry(endpoint.as_str())
                        .or_default()
                        .insert(rel.id.as_str());
                }
            }
        }

        let resolves = |id: &str| -> bool {
            submitted
                .get(id)
                .is_some_and(|op| !op.is_removal())
                || (!submitted.contains_key(id) && is_live(id))
        };

        for fragment in fragments {
            let mut deps: BTreeSet<TaskId> = BTreeSet::new();
            deps.insert(parse_id.clone());

            let (task_type, data) = match &fragment.data {
                FragmentData::Entity(entity) => {
                    if fragment.operation.is_removal() {
                        if let Some(rels) = removals_referencing.get(entity.id.as_str()) {
                            deps.extend(rels.iter().map(|r| r.to_string()));
                        }
                    }
                    (
                        TaskType::EntityUpsert,
                        json!({"operation": fragment.operation, "entity": entity}),
                    )
                }
                FragmentData::Relationship(rel) => {
                    if !fragment.operation.is_removal() {
                        for endpoint in [&rel.source, &rel.target] {
                            if resolves(endpoint) {
                                deps.insert(endpoint.clone());
                            }
                        }
                    }
                    (
                        TaskType::RelationshipUpsert,
                        json!({"operation": fragment.operation, "relationship": rel}),
                    )
                }
            };

            for hint in &fragment.dependency_hints {
                if resolves(hint) {
                    deps.insert(hint.clone());
                } else {
                    debug!(fragment = %fragment.id(), hint = %hint, "dependency hint assumed committed");
                }
            }

            let task = self.task(
                event,
                fragment.id().to_string(),
                task_type,
                data,
                fragment.confidence,
            );
            nodes.push(DependencyNode::new(task, deps));

            if let FragmentData::Entity(entity) = &fragment.data {
                if entity.embed && !fragment.operation.is_removal() {
                    let task = self.task(
                        event,
                        embedding_task_id(&entity.id),
                        TaskType::Embedding,
                        json!({"entityId": entity.id, "name": entity.name, "kind": entity.kind, "properties": entity.properties}),
                        fragment.confidence,
                    );
                    nodes.push(DependencyNode::new(task, [entity.id.clone()]));
                }
            }
        }

        debug!(event = %event.id, nodes = nodes.len(), "built DAG nodes for change event");
        Ok(nodes)
    }

    fn task(
        &self,
        event: &ChangeEvent,
        id: TaskId,
        task_type: TaskType,
        data: Value,
        confidence: f64,
    ) -> TaskPayload {
        TaskPayload::new(id, task_type, data)
            .with_priority(default_priority(task_type))
            .with_max_retries(self.max_retries)
            .with_metadata("namespace", json!(event.namespace))
            .with_metadata("module", json!(event.module))
            .with_metadata("filePath", json!(event.file_path))
            .with_metadata("eventId", json!(event.id))
            .with_metadata("confidence", json!(confidence))
    }
}
