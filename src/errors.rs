// src/errors.rs

//! Error taxonomy for the ingestion core.
//!
//! Every error carries a stable `code`, a `retryable` flag and free-form
//! `metadata`. Per-task failures travel as [`WorkerError`] values inside
//! results; only pool-level structural faults surface as [`IngestError`]
//! from `execute_task`.

use serde_json::json;
use thiserror::Error;

use crate::types::{Metadata, TaskId};
use crate::worker::WorkerId;

/// A specific worker failed a specific (or unspecified) task.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("worker error [{code}]: {message}")]
pub struct WorkerError {
    pub code: &'static str,
    pub message: String,
    pub worker_id: Option<WorkerId>,
    pub task_id: Option<TaskId>,
    pub retryable: bool,
    pub metadata: Metadata,
}

impl WorkerError {
    pub const TASK_FAILED: &'static str = "TASK_FAILED";
    pub const TIMEOUT: &'static str = "TASK_TIMEOUT";
    pub const STUCK: &'static str = "WORKER_STUCK";
    pub const RESTARTED: &'static str = "WORKER_RESTARTED";
    pub const UNAVAILABLE: &'static str = "NO_AVAILABLE_WORKERS";
    pub const CRASHED: &'static str = "WORKER_CRASHED";
    pub const SHUTDOWN: &'static str = "POOL_SHUTDOWN";

    /// A retryable worker error with the given code.
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            worker_id: None,
            task_id: None,
            retryable: true,
            metadata: Metadata::new(),
        }
    }

    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::new(Self::TASK_FAILED, message)
    }

    pub fn no_available_workers() -> Self {
        Self::new(Self::UNAVAILABLE, "No available workers")
    }

    pub fn with_worker(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A batch failed partially or wholly.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("batch {batch_id} failed: {} of {total} items", .failed_items.len())]
pub struct BatchProcessingError {
    pub batch_id: String,
    pub total: usize,
    /// Task ids that failed and may be retried individually.
    pub failed_items: Vec<TaskId>,
    pub retryable: bool,
    pub metadata: Metadata,
}

impl BatchProcessingError {
    pub const CODE: &'static str = "BATCH_PROCESSING_FAILED";
}

#[derive(Error, Debug)]
pub enum IngestError {
    /// Generic pipeline fault.
    #[error("ingestion error [{code}]: {message}")]
    Ingestion {
        code: &'static str,
        message: String,
        retryable: bool,
        metadata: Metadata,
    },

    #[error("worker pool is not running")]
    PoolNotRunning,

    #[error("no handler registered for task type {0}")]
    NoHandler(crate::types::TaskType),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    BatchProcessing(#[from] BatchProcessingError),

    /// Producers must shed load or block; retrying immediately cannot help.
    #[error("task queue overflow: max size {max_size} reached")]
    QueueOverflow { max_size: usize },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    pub fn ingestion(code: &'static str, message: impl Into<String>) -> Self {
        IngestError::Ingestion {
            code,
            message: message.into(),
            retryable: false,
            metadata: Metadata::new(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Ingestion { code, .. } => code,
            IngestError::PoolNotRunning => "POOL_NOT_RUNNING",
            IngestError::NoHandler(_) => "NO_HANDLER",
            IngestError::Worker(e) => e.code,
            IngestError::BatchProcessing(_) => BatchProcessingError::CODE,
            IngestError::QueueOverflow { .. } => "QUEUE_OVERFLOW",
            IngestError::ConfigError(_) => "CONFIG_ERROR",
            IngestError::IoError(_) => "IO_ERROR",
            IngestError::TomlError(_) => "TOML_ERROR",
            IngestError::JsonError(_) => "JSON_ERROR",
            IngestError::Other(_) => "INTERNAL",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            IngestError::Ingestion { retryable, .. } => *retryable,
            IngestError::Worker(e) => e.retryable,
            IngestError::BatchProcessing(e) => e.retryable,
            _ => false,
        }
    }

    pub fn metadata(&self) -> Metadata {
        match self {
            IngestError::Ingestion { metadata, .. } => metadata.clone(),
            IngestError::Worker(e) => e.metadata.clone(),
            IngestError::BatchProcessing(e) => {
                let mut meta = e.metadata.clone();
                meta.insert("failedItems".to_string(), json!(e.failed_items));
                meta
            }
            IngestError::QueueOverflow { max_size } => {
                let mut meta = Metadata::new();
                meta.insert("maxSize".to_string(), json!(max_size));
                meta
            }
            _ => Metadata::new(),
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_overflow_is_not_retryable() {
        let err = IngestError::QueueOverflow { max_size: 8 };
        assert_eq!(err.code(), "QUEUE_OVERFLOW");
        assert!(!err.retryable());
        assert_eq!(err.metadata().get("maxSize"), Some(&json!(8)));
    }

    #[test]
    fn worker_errors_default_to_retryable() {
        let err: IngestError = WorkerError::no_available_workers().into();
        assert_eq!(err.code(), WorkerError::UNAVAILABLE);
        assert!(err.retryable());
        assert_eq!(err.to_string(), "worker error [NO_AVAILABLE_WORKERS]: No available workers");
    }

    #[test]
    fn batch_error_exposes_failed_items() {
        let err: IngestError = BatchProcessingError {
            batch_id: "b1".into(),
            total: 3,
            failed_items: vec!["x".into()],
            retryable: true,
            metadata: Metadata::new(),
        }
        .into();
        assert_eq!(err.to_string(), "batch b1 failed: 1 of 3 items");
        assert_eq!(err.metadata().get("failedItems"), Some(&json!(["x"])));
    }
}
