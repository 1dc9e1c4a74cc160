// src/events.rs

//! Outbound observability surface.
//!
//! Components publish [`PipelineEvent`]s on an [`EventBus`]; telemetry or
//! gateway layers subscribe to it. Publishing never blocks and never fails
//! when nobody is listening.

use tokio::sync::broadcast;
use tracing::trace;

use crate::batch::{BatchMetadata, BatchResult};
use crate::errors::{BatchProcessingError, WorkerError};
use crate::pool::PoolMetrics;
use crate::worker::WorkerId;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    WorkerStarted(WorkerId),
    WorkerStopped(WorkerId),
    WorkerError(WorkerError),
    BatchCreated(BatchMetadata),
    BatchCompleted(BatchResult),
    BatchFailed {
        result: BatchResult,
        error: BatchProcessingError,
    },
    QueueOverflow {
        max_size: usize,
    },
    MetricsUpdated(PoolMetrics),
    /// Dependency cycles that will never be executed.
    CyclesDetected(Vec<Vec<String>>),
}

impl PipelineEvent {
    /// Topic name of the event, as used by the external gateway.
    pub fn topic(&self) -> &'static str {
        match self {
            PipelineEvent::WorkerStarted(_) => "worker:started",
            PipelineEvent::WorkerStopped(_) => "worker:stopped",
            PipelineEvent::WorkerError(_) => "worker:error",
            PipelineEvent::BatchCreated(_) => "batch:created",
            PipelineEvent::BatchCompleted(_) => "batch:completed",
            PipelineEvent::BatchFailed { .. } => "batch:failed",
            PipelineEvent::QueueOverflow { .. } => "queue:overflow",
            PipelineEvent::MetricsUpdated(_) => "metrics:updated",
            PipelineEvent::CyclesDetected(_) => "dag:cycles",
        }
    }
}

/// Cheaply cloneable broadcast publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PipelineEvent) {
        let topic = event.topic();
        // No subscribers is fine.
        if self.tx.send(event).is_err() {
            trace!(topic, "event dropped; no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
