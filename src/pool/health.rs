// src/pool/health.rs

//! Health supervision: liveness pings, stuck-worker detection and
//! restart-on-error-threshold.
//!
//! A restart is an explicit transition sequence driven from here:
//! the old worker goes `error -> stopping -> stopped` while a fresh worker
//! (new id, same config) takes its slot and goes `starting -> idle`. The swap
//! happens in a single lock acquisition so the active worker count never
//! changes during a restart.

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::errors::WorkerError;
use crate::events::PipelineEvent;
use crate::pool::WorkerPool;
use crate::worker::{WorkerId, WorkerStatus};

/// What one health-check pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Idle workers that answered their ping.
    pub healthy: usize,
    /// `(old, new)` ids of restarted workers.
    pub restarted: Vec<(WorkerId, WorkerId)>,
    /// Workers added to get back to `min_workers`.
    pub replenished: usize,
}

impl WorkerPool {
    /// Run one health-check pass. The supervision loop calls this every
    /// `health_check_interval`.
    pub async fn run_health_check(&self) -> HealthReport {
        let mut report = HealthReport::default();
        let config = &self.shared.config;
        let stuck_after = config.worker_timeout * 2;

        let (stuck, failing, idle) = {
            let state = self.state();
            if !state.running {
                return report;
            }
            let mut stuck = Vec::new();
            let mut failing = Vec::new();
            let mut idle = Vec::new();
            for worker in &state.workers {
                match worker.status {
                    WorkerStatus::Busy if worker.busy_for().is_some_and(|d| d > stuck_after) => {
                        stuck.push((worker.id, worker.busy_for().unwrap_or_default()));
                    }
                    WorkerStatus::Error if worker.error_count >= config.restart_threshold => {
                        failing.push((worker.id, worker.error_count));
                    }
                    WorkerStatus::Idle => idle.push((worker.id, worker.strategy.clone())),
                    _ => {}
                }
            }
            (stuck, failing, idle)
        };

        for (id, busy_for) in stuck {
            warn!(worker_id = %id, busy_ms = busy_for.as_millis() as u64, "worker stuck in busy; restarting");
            let reason = WorkerError::new(
                WorkerError::STUCK,
                format!("worker stuck in busy for {busy_for:?}"),
            );
            if let Some(new_id) = self.restart_worker(id, reason).await {
                report.restarted.push((id, new_id));
            }
        }

        for (id, errors) in failing {
            warn!(worker_id = %id, errors, "worker exceeded restart threshold; restarting");
            let reason = WorkerError::new(
                WorkerError::RESTARTED,
                format!("worker restarted after {errors} consecutive errors"),
            );
            if let Some(new_id) = self.restart_worker(id, reason).await {
                report.restarted.push((id, new_id));
            }
        }

        let timeout = self.ping_timeout();
        let pings = idle.into_iter().map(|(id, strategy)| async move {
            (id, strategy.ping(timeout).await)
        });
        for (id, alive) in join_all(pings).await {
            if alive {
                report.healthy += 1;
                continue;
            }
            // A worker picked up a task while we waited; stuck detection
            // covers it from now on.
            if self.worker_status(id) != Some(WorkerStatus::Idle) {
                continue;
            }
            error!(worker_id = %id, "worker failed liveness ping; restarting");
            let reason = WorkerError::new(WorkerError::CRASHED, "worker failed liveness ping");
            if let Some(new_id) = self.restart_worker(id, reason).await {
                report.restarted.push((id, new_id));
            }
        }

        let missing = config.min_workers.saturating_sub(self.worker_count());
        if missing > 0 {
            warn!(missing, "pool below min_workers; replenishing");
            report.replenished = self.add_workers(missing, None).await.unwrap_or_default();
        }

        report
    }

    /// Replace `worker_id` with a fresh worker. The caller of the in-flight
    /// task, if any, receives `reason` as a failed result.
    ///
    /// Returns the new worker's id, or `None` if the worker was already gone
    /// or no replacement could be created.
    pub(crate) async fn restart_worker(&self, worker_id: WorkerId, reason: WorkerError) -> Option<WorkerId> {
        let (mut old, new_id) = {
            let mut state = self.state();
            let idx = state.workers.iter().position(|w| w.id == worker_id)?;
            let task_type = state.workers[idx].config.task_type;

            let (old, new_id) = match self.build_worker(task_type) {
                Ok(fresh) => {
                    let new_id = fresh.id;
                    (std::mem::replace(&mut state.workers[idx], fresh), Some(new_id))
                }
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "failed to create replacement worker");
                    (state.workers.remove(idx), None)
                }
            };
            state.restarts += 1;
            (old, new_id)
        };

        let mut reason = reason.with_worker(worker_id);
        if let Some(task_id) = &old.current_task {
            reason = reason.with_task(task_id.clone());
        }
        if let Some(interrupt) = old.interrupt.take() {
            let _ = interrupt.send(reason.clone());
        }
        self.shared.bus.publish(PipelineEvent::WorkerError(reason));

        old.set_status(WorkerStatus::Error);
        old.set_status(WorkerStatus::Stopping);
        self.shutdown_workers(vec![old]).await;

        let new_id = new_id?;
        info!(old_worker_id = %worker_id, worker_id = %new_id, "worker restarted");
        self.shared.bus.publish(PipelineEvent::WorkerStarted(new_id));
        self.activate(new_id).await;
        Some(new_id)
    }
}
