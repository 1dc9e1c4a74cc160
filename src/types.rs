// src/types.rs

//! Data crossing every boundary of the ingestion core: change events coming
//! from a watcher, the graph-mutation fragments they decompose into, and the
//! task payloads handed to the worker pool.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Natural identifier of a task. Entity and relationship tasks reuse the id
/// of the graph element they write, which is what makes retries idempotent.
pub type TaskId = String;

/// Free-form metadata attached to events, tasks and errors.
pub type Metadata = BTreeMap<String, Value>;

/// Kind of work a [`TaskPayload`] asks a worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Parse,
    EntityUpsert,
    RelationshipUpsert,
    Embedding,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::Parse,
        TaskType::EntityUpsert,
        TaskType::RelationshipUpsert,
        TaskType::Embedding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Parse => "parse",
            TaskType::EntityUpsert => "entity_upsert",
            TaskType::RelationshipUpsert => "relationship_upsert",
            TaskType::Embedding => "embedding",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "parse" => Ok(TaskType::Parse),
            "entity_upsert" => Ok(TaskType::EntityUpsert),
            "relationship_upsert" => Ok(TaskType::RelationshipUpsert),
            "embedding" => Ok(TaskType::Embedding),
            other => Err(format!(
                "invalid task type: {other} (expected parse, entity_upsert, relationship_upsert or embedding)"
            )),
        }
    }
}

/// What happened to a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeEventType {
    Created,
    Modified,
    Deleted,
}

/// One observed source change. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub id: String,
    pub namespace: String,
    pub module: String,
    pub file_path: String,
    pub event_type: ChangeEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub diff_hash: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Whether a fragment mutates a node or an edge of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Entity,
    Relationship,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentOperation {
    Add,
    Update,
    Remove,
}

impl FragmentOperation {
    pub fn is_removal(&self) -> bool {
        matches!(self, FragmentOperation::Remove)
    }
}

/// Entity payload of a fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub id: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub properties: Value,
    /// Request an embedding task for this entity once it is committed.
    #[serde(default)]
    pub embed: bool,
}

/// Relationship payload of a fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipData {
    pub id: String,
    pub source: String,
    pub target: String,
    pub kind: String,
    #[serde(default)]
    pub properties: Value,
}

/// Payload of a fragment. Relationship is tried first when deserializing
/// because its `source`/`target` fields are what tell the two apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FragmentData {
    Relationship(RelationshipData),
    Entity(EntityData),
}

impl FragmentData {
    pub fn change_type(&self) -> ChangeType {
        match self {
            FragmentData::Entity(_) => ChangeType::Entity,
            FragmentData::Relationship(_) => ChangeType::Relationship,
        }
    }

    /// Natural key of the graph element this data writes.
    pub fn element_id(&self) -> &str {
        match self {
            FragmentData::Entity(e) => &e.id,
            FragmentData::Relationship(r) => &r.id,
        }
    }
}

/// One graph-mutation intent decomposed from a [`ChangeEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeFragment {
    pub change_type: ChangeType,
    pub operation: FragmentOperation,
    pub data: FragmentData,
    /// Ids of graph elements this fragment depends on.
    #[serde(default)]
    pub dependency_hints: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl ChangeFragment {
    pub fn entity(operation: FragmentOperation, data: EntityData) -> Self {
        Self {
            change_type: ChangeType::Entity,
            operation,
            data: FragmentData::Entity(data),
            dependency_hints: Vec::new(),
            confidence: 1.0,
        }
    }

    pub fn relationship(operation: FragmentOperation, data: RelationshipData) -> Self {
        Self {
            change_type: ChangeType::Relationship,
            operation,
            data: FragmentData::Relationship(data),
            dependency_hints: Vec::new(),
            confidence: 1.0,
        }
    }

    /// Whether the declared `change_type` agrees with the payload shape.
    pub fn is_consistent(&self) -> bool {
        self.change_type == self.data.change_type()
    }

    pub fn id(&self) -> &str {
        self.data.element_id()
    }
}

/// Unit of work submitted to the pool.
///
/// Owned exclusively by the queue/pool until it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Higher values run first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl TaskPayload {
    pub fn new(id: impl Into<TaskId>, task_type: TaskType, data: Value) -> Self {
        Self {
            id: id.into(),
            task_type,
            priority: 0,
            data,
            metadata: Metadata::new(),
            retry_count: 0,
            max_retries: 0,
            created_at: Utc::now(),
            scheduled_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Namespace the task belongs to, if the producer recorded one.
    pub fn namespace(&self) -> Option<&str> {
        self.metadata.get("namespace").and_then(Value::as_str)
    }

    /// Whether a delayed (retry) task may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }
}

/// How a worker runs its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Direct call of the registered handler on the pool's runtime.
    #[default]
    InProcess,
    /// Dedicated OS thread reached through message passing.
    Isolated,
}

/// Signal the auto-scaler uses to estimate backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadEstimatorKind {
    /// Approximation derived from the share of busy workers.
    #[default]
    IdleRatio,
    /// Real depth of the task queue.
    QueueDepth,
}

/// What happens to dependents of a node whose retries are exhausted.
///
/// - `Isolate`: dependents stay pending and are reported as blocked.
/// - `Propagate`: dependents are failed transitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Isolate,
    Propagate,
}
