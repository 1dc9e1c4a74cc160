// src/sink.rs

//! Graph persistence behind the task handlers.
//!
//! Every [`GraphSink`] write is idempotent by natural key: applying the same
//! task twice leaves the graph as if it was applied once. Writes report
//! whether they changed anything.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::pool::WorkerPool;
use crate::types::{EntityData, FragmentOperation, RelationshipData, TaskPayload, TaskType};

/// Dimensions of the embeddings produced by [`hash_embedding`].
pub const EMBEDDING_DIMS: usize = 32;

pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Destination of graph mutations.
pub trait GraphSink: Send + Sync + fmt::Debug {
    fn upsert_entity(&self, entity: EntityData) -> SinkFuture<'_, bool>;
    fn remove_entity(&self, id: String) -> SinkFuture<'_, bool>;
    fn upsert_relationship(&self, relationship: RelationshipData) -> SinkFuture<'_, bool>;
    fn remove_relationship(&self, id: String) -> SinkFuture<'_, bool>;
    fn store_embedding(&self, entity_id: String, vector: Vec<f32>) -> SinkFuture<'_, bool>;
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct GraphSnapshot {
    pub entities: BTreeMap<String, EntityData>,
    pub relationships: BTreeMap<String, RelationshipData>,
    pub embeddings: BTreeMap<String, Vec<f32>>,
}

/// In-memory [`GraphSink`] over ordered maps.
///
/// In strict mode a relationship whose endpoints are not both present is
/// rejected with a retryable error instead of being stored dangling.
#[derive(Debug, Default, Clone)]
pub struct MemoryGraphSink {
    graph: Arc<Mutex<GraphSnapshot>>,
    strict: bool,
}

impl MemoryGraphSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, GraphSnapshot> {
        self.graph.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        self.lock().clone()
    }

    pub fn entity(&self, id: &str) -> Option<EntityData> {
        self.lock().entities.get(id).cloned()
    }

    pub fn relationship(&self, id: &str) -> Option<RelationshipData> {
        self.lock().relationships.get(id).cloned()
    }

    pub fn embedding(&self, entity_id: &str) -> Option<Vec<f32>> {
        self.lock().embeddings.get(entity_id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.lock().entities.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.lock().relationships.len()
    }
}

impl GraphSink for MemoryGraphSink {
    fn upsert_entity(&self, entity: EntityData) -> SinkFuture<'_, bool> {
        Box::pin(async move {
            let mut graph = self.lock();
            if graph.entities.get(&entity.id) == Some(&entity) {
                return Ok(false);
            }
            trace!(entity = %entity.id, "upserting entity");
            graph.entities.insert(entity.id.clone(), entity);
            Ok(true)
        })
    }

    fn remove_entity(&self, id: String) -> SinkFuture<'_, bool> {
        Box::pin(async move {
            let mut graph = self.lock();
            graph.embeddings.remove(&id);
            Ok(graph.entities.remove(&id).is_some())
        })
    }

    fn upsert_relationship(&self, relationship: RelationshipData) -> SinkFuture<'_, bool> {
        Box::pin(async move {
            let mut graph = self.lock();
            if self.strict {
                for endpoint in [&relationship.source, &relationship.target] {
                    if !graph.entities.contains_key(endpoint) {
                        bail!(
                            "relationship {} references missing entity {endpoint}",
                            relationship.id
                        );
                    }
                }
            }
            if graph.relationships.get(&relationship.id) == Some(&relationship) {
                return Ok(false);
            }
            trace!(relationship = %relationship.id, "upserting relationship");
            graph.relationships.insert(relationship.id.clone(), relationship);
            Ok(true)
        })
    }

    fn remove_relationship(&self, id: String) -> SinkFuture<'_, bool> {
        Box::pin(async move { Ok(self.lock().relationships.remove(&id).is_some()) })
    }

    fn store_embedding(&self, entity_id: String, vector: Vec<f32>) -> SinkFuture<'_, bool> {
        Box::pin(async move {
            let mut graph = self.lock();
            if graph.embeddings.get(&entity_id) == Some(&vector) {
                return Ok(false);
            }
            graph.embeddings.insert(entity_id, vector);
            Ok(true)
        })
    }
}

/// Deterministic unit-length embedding of `text`, derived from its blake3
/// XOF output.
pub fn hash_embedding(text: &str) -> Vec<f32> {
    let mut bytes = [0u8; EMBEDDING_DIMS * 4];
    blake3::Hasher::new()
        .update(text.as_bytes())
        .finalize_xof()
        .fill(&mut bytes);

    let raw: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| {
            let n = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            (n as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32
        })
        .collect();

    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return raw;
    }
    raw.into_iter().map(|x| x / norm).collect()
}

#[derive(Debug, Deserialize)]
struct EntityTask {
    operation: FragmentOperation,
    entity: EntityData,
}

#[derive(Debug, Deserialize)]
struct RelationshipTask {
    operation: FragmentOperation,
    relationship: RelationshipData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmbeddingTask {
    entity_id: String,
    name: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    properties: Value,
}

async fn apply_entity(sink: &dyn GraphSink, task: TaskPayload) -> anyhow::Result<Value> {
    let EntityTask { operation, entity } = serde_json::from_value(task.data)
        .with_context(|| format!("malformed entity task {}", task.id))?;
    let id = entity.id.clone();
    let changed = if operation.is_removal() {
        sink.remove_entity(id.clone()).await?
    } else {
        sink.upsert_entity(entity).await?
    };
    debug!(entity = %id, ?operation, changed, "entity applied");
    Ok(json!({ "id": id, "operation": operation, "changed": changed }))
}

async fn apply_relationship(sink: &dyn GraphSink, task: TaskPayload) -> anyhow::Result<Value> {
    let RelationshipTask {
        operation,
        relationship,
    } = serde_json::from_value(task.data)
        .with_context(|| format!("malformed relationship task {}", task.id))?;
    let id = relationship.id.clone();
    let changed = if operation.is_removal() {
        sink.remove_relationship(id.clone()).await?
    } else {
        sink.upsert_relationship(relationship).await?
    };
    debug!(relationship = %id, ?operation, changed, "relationship applied");
    Ok(json!({ "id": id, "operation": operation, "changed": changed }))
}

async fn apply_embedding(sink: &dyn GraphSink, task: TaskPayload) -> anyhow::Result<Value> {
    let EmbeddingTask {
        entity_id,
        name,
        kind,
        properties,
    } = serde_json::from_value(task.data)
        .with_context(|| format!("malformed embedding task {}", task.id))?;
    let text = format!("{kind} {name} {properties}");
    let vector = hash_embedding(&text);
    let changed = sink.store_embedding(entity_id.clone(), vector).await?;
    Ok(json!({ "entityId": entity_id, "dims": EMBEDDING_DIMS, "changed": changed }))
}

/// Register handlers writing to `sink` for every task type. `parse` tasks
/// only acknowledge the change event they carry.
pub fn register_sink_handlers(pool: &WorkerPool, sink: Arc<dyn GraphSink>) {
    let s = Arc::clone(&sink);
    pool.register_handler(TaskType::EntityUpsert, move |task: TaskPayload| {
        let sink = Arc::clone(&s);
        async move { apply_entity(sink.as_ref(), task).await }
    });

    let s = Arc::clone(&sink);
    pool.register_handler(TaskType::RelationshipUpsert, move |task: TaskPayload| {
        let sink = Arc::clone(&s);
        async move { apply_relationship(sink.as_ref(), task).await }
    });

    let s = sink;
    pool.register_handler(TaskType::Embedding, move |task: TaskPayload| {
        let sink = Arc::clone(&s);
        async move { apply_embedding(sink.as_ref(), task).await }
    });

    pool.register_handler(TaskType::Parse, |task: TaskPayload| async move {
        let file = task.metadata.get("filePath").cloned().unwrap_or(Value::Null);
        Ok::<_, anyhow::Error>(json!({ "acknowledged": true, "filePath": file }))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str) -> EntityData {
        EntityData {
            id: id.into(),
            kind: "file".into(),
            name: id.into(),
            properties: Value::Null,
            embed: false,
        }
    }

    fn rel(id: &str, source: &str, target: &str) -> RelationshipData {
        RelationshipData {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            kind: "contains".into(),
            properties: Value::Null,
        }
    }

    #[tokio::test]
    async fn upserts_are_idempotent() {
        let sink = MemoryGraphSink::new();
        assert!(sink.upsert_entity(entity("a")).await.unwrap());
        assert!(!sink.upsert_entity(entity("a")).await.unwrap());
        assert_eq!(sink.entity_count(), 1);

        assert!(sink.remove_entity("a".into()).await.unwrap());
        assert!(!sink.remove_entity("a".into()).await.unwrap());
    }

    #[tokio::test]
    async fn strict_sink_rejects_dangling_relationships() {
        let sink = MemoryGraphSink::strict();
        assert!(sink.upsert_relationship(rel("r", "a", "b")).await.is_err());

        sink.upsert_entity(entity("a")).await.unwrap();
        sink.upsert_entity(entity("b")).await.unwrap();
        assert!(sink.upsert_relationship(rel("r", "a", "b")).await.unwrap());
        assert_eq!(sink.relationship_count(), 1);
    }

    #[tokio::test]
    async fn entity_task_removal_goes_through_operation() {
        let sink = MemoryGraphSink::new();
        let add = TaskPayload::new(
            "a",
            TaskType::EntityUpsert,
            json!({ "operation": "add", "entity": entity("a") }),
        );
        apply_entity(&sink, add).await.unwrap();
        assert!(sink.entity("a").is_some());

        let remove = TaskPayload::new(
            "a",
            TaskType::EntityUpsert,
            json!({ "operation": "remove", "entity": entity("a") }),
        );
        let out = apply_entity(&sink, remove).await.unwrap();
        assert_eq!(out["changed"], json!(true));
        assert!(sink.entity("a").is_none());
    }

    #[test]
    fn hash_embedding_is_deterministic_and_normalised() {
        let a = hash_embedding("file lib.rs");
        assert_eq!(a, hash_embedding("file lib.rs"));
        assert_ne!(a, hash_embedding("file main.rs"));
        assert_eq!(a.len(), EMBEDDING_DIMS);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
