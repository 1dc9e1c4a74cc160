// src/pool/dispatch.rs

//! Routing tasks onto workers.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use futures::future::join_all;
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::errors::{IngestError, Result, WorkerError};
use crate::events::PipelineEvent;
use crate::pool::WorkerPool;
use crate::types::{TaskPayload, TaskType};
use crate::worker::{ExecutionStrategy, WorkerId, WorkerResult, WorkerStatus};

/// Exclusive claim on one worker for one task.
struct Lease {
    worker_id: WorkerId,
    strategy: ExecutionStrategy,
    interrupt: oneshot::Receiver<WorkerError>,
    timeout: Duration,
}

enum Outcome {
    Finished(std::result::Result<Value, WorkerError>),
    TimedOut,
    Interrupted(WorkerError),
}

impl WorkerPool {
    /// Run one task on an available worker.
    ///
    /// Worker selection: an idle worker dedicated to the task's type, then any
    /// idle worker (handlers are shared by all workers). If none is idle and
    /// auto-scaling has headroom, one worker is created and selection is
    /// retried once.
    ///
    /// Task failures (handler errors, timeouts, restarts) come back as a
    /// `WorkerResult` with `success == false`. Only pool-level faults are
    /// errors: pool not running, no handler for the type, no worker obtainable.
    pub async fn execute_task(&self, task: TaskPayload) -> Result<WorkerResult> {
        if !self.is_running() {
            return Err(IngestError::PoolNotRunning);
        }
        if !self.shared.handlers.contains(task.task_type) {
            return Err(IngestError::NoHandler(task.task_type));
        }

        let lease = match self.acquire(&task) {
            Some(lease) => lease,
            None => {
                if !self.shared.config.auto_scale || !self.has_headroom() {
                    return Err(WorkerError::no_available_workers().with_task(task.id).into());
                }
                debug!(task_id = %task.id, task_type = %task.task_type, "no idle worker; scaling up for task");
                self.add_workers(1, Some(task.task_type)).await?;
                match self.acquire(&task) {
                    Some(lease) => lease,
                    None => {
                        return Err(WorkerError::no_available_workers().with_task(task.id).into());
                    }
                }
            }
        };

        Ok(self.run_on_worker(lease, task).await)
    }

    /// Run many tasks concurrently. Tasks are dispatched grouped by type; one
    /// task's failure never affects its siblings. Results are returned in
    /// input order.
    pub async fn execute_tasks(&self, tasks: Vec<TaskPayload>) -> Vec<Result<WorkerResult>> {
        self.settle_all(tasks, |pool, task| async move { pool.execute_task(task).await })
            .await
    }

    /// Like [`WorkerPool::execute_task`], but waits for a worker to become
    /// idle instead of failing with `NO_AVAILABLE_WORKERS`.
    pub async fn submit(&self, task: TaskPayload) -> Result<WorkerResult> {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            // Register before trying so a worker released in between is seen.
            notified.as_mut().enable();

            match self.execute_task(task.clone()).await {
                Err(IngestError::Worker(e)) if e.code == WorkerError::UNAVAILABLE => {
                    self.shared.waiting.fetch_add(1, Ordering::Relaxed);
                    let wait = self.shared.config.scale_check_interval;
                    let _ = tokio::time::timeout(wait, notified).await;
                    self.shared.waiting.fetch_sub(1, Ordering::Relaxed);
                }
                other => return other,
            }
        }
    }

    /// [`WorkerPool::submit`] for many tasks, with the grouping and ordering
    /// of [`WorkerPool::execute_tasks`].
    pub async fn submit_all(&self, tasks: Vec<TaskPayload>) -> Vec<Result<WorkerResult>> {
        self.settle_all(tasks, |pool, task| async move { pool.submit(task).await })
            .await
    }

    async fn settle_all<F, Fut>(&self, tasks: Vec<TaskPayload>, run: F) -> Vec<Result<WorkerResult>>
    where
        F: Fn(WorkerPool, TaskPayload) -> Fut,
        Fut: std::future::Future<Output = Result<WorkerResult>>,
    {
        let mut indexed: Vec<(usize, TaskPayload)> = tasks.into_iter().enumerate().collect();
        // Stable: FIFO within a type group.
        indexed.sort_by_key(|(_, task)| task.task_type);

        let runs = indexed.into_iter().map(|(idx, task)| {
            let fut = run(self.clone(), task);
            async move { (idx, fut.await) }
        });
        let mut settled = join_all(runs).await;
        settled.sort_by_key(|(idx, _)| *idx);
        settled.into_iter().map(|(_, result)| result).collect()
    }

    fn has_headroom(&self) -> bool {
        self.state().workers.len() < self.shared.config.max_workers
    }

    /// Claim an idle worker for `task`, marking it busy.
    fn acquire(&self, task: &TaskPayload) -> Option<Lease> {
        let mut state = self.state();
        let preferred = state
            .workers
            .iter()
            .position(|w| w.is_available() && w.config.task_type == Some(task.task_type));
        let idx = preferred.or_else(|| state.workers.iter().position(|w| w.is_available()))?;

        let worker = &mut state.workers[idx];
        if !worker.set_status(WorkerStatus::Busy) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        worker.current_task = Some(task.id.clone());
        worker.busy_since = Some(Instant::now());
        worker.interrupt = Some(tx);

        Some(Lease {
            worker_id: worker.id,
            strategy: worker.strategy.clone(),
            interrupt: rx,
            timeout: worker.config.timeout,
        })
    }

    async fn run_on_worker(&self, mut lease: Lease, task: TaskPayload) -> WorkerResult {
        let task_id = task.id.clone();
        let task_type = task.task_type;
        let worker_id = lease.worker_id;
        let started = Instant::now();
        debug!(worker_id = %worker_id, task_id = %task_id, task_type = %task_type, "dispatching task");

        let mut outcome = tokio::select! {
            biased;
            Ok(err) = &mut lease.interrupt => Outcome::Interrupted(err),
            res = tokio::time::timeout(lease.timeout, lease.strategy.execute(worker_id, task)) => match res {
                Ok(done) => Outcome::Finished(done),
                Err(_) => Outcome::TimedOut,
            },
        };
        // A handler that blocked its thread may finish after the worker was
        // already restarted; the restart wins.
        if let Ok(err) = lease.interrupt.try_recv() {
            outcome = Outcome::Interrupted(err);
        }
        let duration = started.elapsed();

        match outcome {
            Outcome::Finished(Ok(value)) => {
                self.record_completion(worker_id, task_type, duration, true, true);
                debug!(worker_id = %worker_id, task_id = %task_id, elapsed_ms = duration.as_millis() as u64, "task completed");
                WorkerResult::succeeded(task_id, worker_id, value, duration)
            }
            Outcome::Finished(Err(err)) => {
                let err = err.with_worker(worker_id).with_task(task_id.clone());
                warn!(worker_id = %worker_id, task_id = %task_id, code = err.code, error = %err.message, "task failed");
                let crashed = err.code == WorkerError::CRASHED;
                self.record_completion(worker_id, task_type, duration, false, !crashed);
                self.report_failure(task_type, &err);
                if crashed {
                    let reason = WorkerError::new(WorkerError::CRASHED, "worker crashed while running a task");
                    self.restart_worker(worker_id, reason).await;
                }
                WorkerResult::failed(task_id, Some(worker_id), err, duration)
            }
            Outcome::TimedOut => {
                let err = WorkerError::new(
                    WorkerError::TIMEOUT,
                    format!("task exceeded worker timeout of {:?}", lease.timeout),
                )
                .with_worker(worker_id)
                .with_task(task_id.clone());
                warn!(worker_id = %worker_id, task_id = %task_id, "task timed out; resetting worker");
                self.record_completion(worker_id, task_type, duration, false, false);
                self.report_failure(task_type, &err);
                self.restart_worker(worker_id, err.clone()).await;
                WorkerResult::failed(task_id, Some(worker_id), err, duration)
            }
            Outcome::Interrupted(err) => {
                let err = err.with_task(task_id.clone());
                debug!(worker_id = %worker_id, task_id = %task_id, code = err.code, "in-flight task interrupted");
                self.record_pool_failure(duration);
                counter!("ingest_tasks_failed", "type" => task_type.as_str(), "code" => err.code)
                    .increment(1);
                WorkerResult::failed(task_id, Some(worker_id), err, duration)
            }
        }
    }

    /// Update worker and pool bookkeeping after a task ends on `worker_id`.
    ///
    /// With `release == false` the worker is left in `Error` for an imminent
    /// restart instead of going back to `Idle`.
    fn record_completion(
        &self,
        worker_id: WorkerId,
        task_type: TaskType,
        duration: Duration,
        success: bool,
        release: bool,
    ) {
        histogram!("ingest_task_duration", "type" => task_type.as_str()).record(duration);
        if success {
            counter!("ingest_tasks_processed", "type" => task_type.as_str()).increment(1);
        }

        let threshold = self.shared.config.restart_threshold;
        let became_idle = {
            let mut state = self.state();
            state.tasks_processed += 1;
            state.total_latency += duration;
            if !success {
                state.tasks_failed += 1;
            }

            // Gone if it was restarted or removed meanwhile.
            let Some(worker) = state.worker_mut(worker_id) else {
                return;
            };
            worker.metrics.record(duration, success);
            worker.interrupt = None;
            if worker.status != WorkerStatus::Busy {
                return;
            }

            if success {
                worker.error_count = 0;
                worker.set_status(WorkerStatus::Idle)
            } else {
                worker.error_count += 1;
                worker.set_status(WorkerStatus::Error);
                if !release {
                    false
                } else if worker.error_count < threshold {
                    worker.set_status(WorkerStatus::Idle)
                } else {
                    warn!(
                        worker_id = %worker_id,
                        errors = worker.error_count,
                        "worker reached restart threshold"
                    );
                    false
                }
            }
        };

        if became_idle {
            self.shared.idle.notify_waiters();
        }
    }

    /// Count a failure whose worker has already been replaced.
    fn record_pool_failure(&self, duration: Duration) {
        let mut state = self.state();
        state.tasks_processed += 1;
        state.tasks_failed += 1;
        state.total_latency += duration;
    }

    fn report_failure(&self, task_type: TaskType, err: &WorkerError) {
        counter!("ingest_tasks_failed", "type" => task_type.as_str(), "code" => err.code).increment(1);
        self.shared.bus.publish(PipelineEvent::WorkerError(err.clone()));
    }
}
