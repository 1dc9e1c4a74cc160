// src/batch/metadata.rs

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::errors::WorkerError;
use crate::types::{TaskId, TaskPayload, TaskType};

/// Describes a homogeneous group of tasks flushed together.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    /// Unique per emitted batch; consumers use it for idempotency.
    pub id: String,
    #[serde(rename = "type")]
    pub batch_type: TaskType,
    pub size: usize,
    /// Highest priority among the batch's tasks.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl BatchMetadata {
    /// Describe `tasks`. `epoch_id` / `namespace` are only set when every task
    /// agrees on the value.
    pub fn describe(batch_type: TaskType, tasks: &[TaskPayload]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            batch_type,
            size: tasks.len(),
            priority: tasks.iter().map(|t| t.priority).max().unwrap_or_default(),
            created_at: Utc::now(),
            epoch_id: shared_str(tasks, "epochId"),
            namespace: shared_str(tasks, "namespace"),
        }
    }
}

fn shared_str(tasks: &[TaskPayload], key: &str) -> Option<String> {
    let mut values = tasks
        .iter()
        .map(|t| t.metadata.get(key).and_then(Value::as_str));
    let first = values.next()??;
    values
        .all(|v| v == Some(first))
        .then(|| first.to_string())
}

/// A flushed group of same-type tasks, FIFO by arrival.
#[derive(Debug, Clone)]
pub struct Batch {
    pub metadata: BatchMetadata,
    pub tasks: Vec<TaskPayload>,
}

impl Batch {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn task_ids(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.id.as_str()).collect()
    }
}

/// Outcome of executing one batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub metadata: BatchMetadata,
    pub processed_count: usize,
    pub failed_count: usize,
    pub duration: Duration,
    pub errors: Vec<WorkerError>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.failed_count == 0
    }

    /// Task ids that failed, in the order the errors were recorded.
    pub fn failed_items(&self) -> Vec<TaskId> {
        self.errors.iter().filter_map(|e| e.task_id.clone()).collect()
    }
}
