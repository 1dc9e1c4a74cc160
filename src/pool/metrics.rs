// src/pool/metrics.rs

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;

use crate::pool::WorkerPool;
use crate::types::TaskType;
use crate::worker::{WorkerId, WorkerMetrics, WorkerStatus};

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub task_type: Option<TaskType>,
    pub metrics: WorkerMetrics,
    pub error_count: u32,
}

/// Point-in-time view of the pool, carried by `MetricsUpdated` events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub total_workers: usize,
    pub starting: usize,
    pub idle: usize,
    pub busy: usize,
    pub error: usize,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    /// `tasks_failed / tasks_processed`, 0 before the first task.
    pub error_rate: f64,
    pub average_latency: Duration,
    pub estimated_load: f64,
    pub waiting_tasks: usize,
    pub restarts: u64,
    pub workers: Vec<WorkerSummary>,
}

impl WorkerPool {
    pub fn metrics(&self) -> PoolMetrics {
        let snapshot = self.load_snapshot();
        let estimated_load = self.shared.estimator.estimate_load(&snapshot);

        let state = self.state();
        let (error_rate, average_latency) = if state.tasks_processed == 0 {
            (0.0, Duration::ZERO)
        } else {
            let n = state.tasks_processed;
            (
                state.tasks_failed as f64 / n as f64,
                state.total_latency.div_f64(n as f64),
            )
        };

        PoolMetrics {
            total_workers: state.workers.len(),
            starting: state.count(WorkerStatus::Starting),
            idle: state.count(WorkerStatus::Idle),
            busy: state.count(WorkerStatus::Busy),
            error: state.count(WorkerStatus::Error),
            tasks_processed: state.tasks_processed,
            tasks_failed: state.tasks_failed,
            error_rate,
            average_latency,
            estimated_load,
            waiting_tasks: self.shared.waiting.load(Ordering::Relaxed),
            restarts: state.restarts,
            workers: state
                .workers
                .iter()
                .map(|w| WorkerSummary {
                    id: w.id,
                    status: w.status,
                    task_type: w.config.task_type,
                    metrics: w.metrics.clone(),
                    error_count: w.error_count,
                })
                .collect(),
        }
    }
}
