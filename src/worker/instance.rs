// src/worker/instance.rs

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::errors::WorkerError;
use crate::types::{Metadata, TaskId, TaskType};
use crate::worker::strategy::ExecutionStrategy;
use crate::worker::WorkerId;

/// Lifecycle of a worker.
///
/// ```text
/// starting -> idle <-> busy
/// idle | busy -> error
/// error -> idle            (below the restart threshold)
/// error -> stopping -> stopped
/// idle -> stopping -> stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Error,
    Stopping,
    Stopped,
}

impl WorkerStatus {
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, next),
            (Starting, Idle)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Idle, Busy)
                | (Idle, Error)
                | (Idle, Stopping)
                | (Busy, Idle)
                | (Busy, Error)
                | (Error, Idle)
                | (Error, Stopping)
                | (Stopping, Stopped)
        )
    }
}

/// Static configuration of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Preferred task type. `None` means a general-purpose worker.
    pub task_type: Option<TaskType>,
    /// Always 1: a worker runs one task at a time.
    pub concurrency: usize,
    pub batch_size: usize,
    pub timeout: Duration,
}

/// Per-worker counters. Monotonic except `average_latency`, a running mean.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetrics {
    pub tasks_processed: u64,
    pub average_latency: Duration,
    pub error_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl WorkerMetrics {
    pub fn record(&mut self, duration: Duration, success: bool) {
        self.tasks_processed += 1;
        if !success {
            self.error_count += 1;
        }
        // avg += (x - avg) / n, in f64 seconds to stay signed.
        let n = self.tasks_processed as f64;
        let avg = self.average_latency.as_secs_f64();
        let next = avg + (duration.as_secs_f64() - avg) / n;
        self.average_latency = Duration::from_secs_f64(next.max(0.0));
        self.last_activity = Some(Utc::now());
    }
}

/// A worker as owned by the pool. Only the pool mutates it.
#[derive(Debug)]
pub struct WorkerInstance {
    pub id: WorkerId,
    pub config: WorkerConfig,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub metrics: WorkerMetrics,
    /// Consecutive failed tasks; reset by a success.
    pub error_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_status_change: DateTime<Utc>,
    pub(crate) busy_since: Option<Instant>,
    pub(crate) strategy: ExecutionStrategy,
    /// Fails the awaiting caller of the in-flight task.
    pub(crate) interrupt: Option<oneshot::Sender<WorkerError>>,
}

impl WorkerInstance {
    pub fn new(id: WorkerId, config: WorkerConfig, strategy: ExecutionStrategy) -> Self {
        let now = Utc::now();
        Self {
            id,
            config,
            status: WorkerStatus::Starting,
            current_task: None,
            metrics: WorkerMetrics::default(),
            error_count: 0,
            created_at: now,
            last_status_change: now,
            busy_since: None,
            strategy,
            interrupt: None,
        }
    }

    /// Apply a status transition. Illegal transitions are refused and
    /// reported as `false`.
    pub fn set_status(&mut self, next: WorkerStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                worker_id = %self.id,
                from = ?self.status,
                to = ?next,
                "refusing illegal worker status transition"
            );
            return false;
        }
        self.status = next;
        self.last_status_change = Utc::now();
        if next != WorkerStatus::Busy {
            self.busy_since = None;
            self.current_task = None;
        }
        true
    }

    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Idle
    }

    /// How long the current task has been running.
    pub fn busy_for(&self) -> Option<Duration> {
        self.busy_since.map(|since| since.elapsed())
    }
}

/// Outcome of one `execute` call, identical for every execution strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResult {
    pub task_id: TaskId,
    pub worker_id: Option<WorkerId>,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<WorkerError>,
    pub duration: Duration,
    pub metadata: Metadata,
}

impl WorkerResult {
    pub fn succeeded(task_id: TaskId, worker_id: WorkerId, result: Value, duration: Duration) -> Self {
        Self {
            task_id,
            worker_id: Some(worker_id),
            success: true,
            result: Some(result),
            error: None,
            duration,
            metadata: Metadata::new(),
        }
    }

    pub fn failed(task_id: TaskId, worker_id: Option<WorkerId>, error: WorkerError, duration: Duration) -> Self {
        Self {
            task_id,
            worker_id,
            success: false,
            result: None,
            error: Some(error),
            duration,
            metadata: Metadata::new(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.retryable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_worker_cannot_be_stopped_directly() {
        assert!(!WorkerStatus::Busy.can_transition_to(WorkerStatus::Stopping));
        assert!(WorkerStatus::Busy.can_transition_to(WorkerStatus::Error));
        assert!(WorkerStatus::Error.can_transition_to(WorkerStatus::Stopping));
        assert!(!WorkerStatus::Stopped.can_transition_to(WorkerStatus::Starting));
    }

    #[test]
    fn average_latency_is_a_running_mean() {
        let mut m = WorkerMetrics::default();
        m.record(Duration::from_millis(10), true);
        m.record(Duration::from_millis(30), false);
        assert_eq!(m.tasks_processed, 2);
        assert_eq!(m.error_count, 1);
        let avg = m.average_latency.as_secs_f64();
        assert!((avg - 0.020).abs() < 1e-9, "avg was {avg}");
        assert!(m.last_activity.is_some());
    }
}
