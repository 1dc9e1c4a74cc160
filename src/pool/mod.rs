// src/pool/mod.rs

//! The worker pool.
//!
//! All pool state (workers, counters, scaling timestamps) lives in one
//! mutex-guarded [`PoolState`]. The lock is never held across an `.await`:
//! every async operation takes what it needs, releases the lock, does its
//! I/O, then re-locks to record the outcome.
//!
//! - [`dispatch`] routes tasks onto idle workers.
//! - [`health`] pings workers and restarts stuck or failing ones.
//! - [`scaling`] decides and applies pool size changes.
//! - [`metrics`] builds [`PoolMetrics`] snapshots.

use std::fmt;
use std::future::Future;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use ::metrics::gauge;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{BatchingConfig, PoolConfig};
use crate::errors::{IngestError, Result, WorkerError};
use crate::events::{EventBus, PipelineEvent};
use crate::types::{LoadEstimatorKind, TaskType};
use crate::worker::{
    ExecutionStrategy, HandlerRegistry, TaskHandler, WorkerConfig, WorkerId, WorkerInstance,
    WorkerStatus,
};

pub mod dispatch;
pub mod health;
pub mod metrics;
pub mod scaling;

pub use health::HealthReport;
pub use self::metrics::{PoolMetrics, WorkerSummary};
pub use scaling::{
    decide_scaling, IdleRatioEstimator, LoadEstimator, LoadSnapshot, QueueDepthEstimator,
    ScalingDecision, ScalingInput,
};

/// Mutable pool state. Only reachable through [`WorkerPool::state`].
#[derive(Debug, Default)]
pub(crate) struct PoolState {
    pub(crate) running: bool,
    /// Active workers in creation order. Workers leave this list when they
    /// start stopping.
    pub(crate) workers: Vec<WorkerInstance>,
    pub(crate) last_scale_up: Option<Instant>,
    pub(crate) last_scale_down: Option<Instant>,
    pub(crate) tasks_processed: u64,
    pub(crate) tasks_failed: u64,
    pub(crate) total_latency: Duration,
    pub(crate) restarts: u64,
}

impl PoolState {
    pub(crate) fn worker_mut(&mut self, id: WorkerId) -> Option<&mut WorkerInstance> {
        self.workers.iter_mut().find(|w| w.id == id)
    }

    pub(crate) fn count(&self, status: WorkerStatus) -> usize {
        self.workers.iter().filter(|w| w.status == status).count()
    }
}

struct Loops {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    pub(crate) batching: BatchingConfig,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) bus: EventBus,
    pub(crate) estimator: Arc<dyn LoadEstimator>,
    pub(crate) state: Mutex<PoolState>,
    /// Callers of `submit` currently waiting for a worker.
    pub(crate) waiting: AtomicUsize,
    /// Signalled whenever a worker becomes idle.
    pub(crate) idle: Notify,
    loops: Mutex<Option<Loops>>,
}

/// Owns the workers, routes tasks onto them, scales the pool and keeps it
/// healthy. Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    pub(crate) shared: Arc<PoolShared>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("WorkerPool")
            .field("running", &state.running)
            .field("workers", &state.workers.len())
            .field("estimator", &self.shared.estimator)
            .finish_non_exhaustive()
    }
}

/// Builder for [`WorkerPool`].
pub struct WorkerPoolBuilder {
    config: PoolConfig,
    batching: BatchingConfig,
    bus: EventBus,
    estimator: Option<Arc<dyn LoadEstimator>>,
}

impl WorkerPoolBuilder {
    pub fn batching(mut self, batching: BatchingConfig) -> Self {
        self.batching = batching;
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Override the estimator selected by `config.load_estimator`.
    pub fn load_estimator(mut self, estimator: Arc<dyn LoadEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn build(self) -> WorkerPool {
        let estimator = self.estimator.unwrap_or_else(|| match self.config.load_estimator {
            LoadEstimatorKind::IdleRatio => Arc::new(IdleRatioEstimator) as Arc<dyn LoadEstimator>,
            // Without an external queue, the only real backlog is callers
            // waiting in `submit`.
            LoadEstimatorKind::QueueDepth => Arc::new(QueueDepthEstimator::new(|| 0)),
        });

        WorkerPool {
            shared: Arc::new(PoolShared {
                config: self.config,
                batching: self.batching,
                handlers: HandlerRegistry::new(),
                bus: self.bus,
                estimator,
                state: Mutex::new(PoolState::default()),
                waiting: AtomicUsize::new(0),
                idle: Notify::new(),
                loops: Mutex::new(None),
            }),
        }
    }
}

impl WorkerPool {
    pub fn builder(config: PoolConfig) -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            config,
            batching: BatchingConfig::default(),
            bus: EventBus::default(),
            estimator: None,
        }
    }

    pub fn new(config: PoolConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, PoolState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Number of active workers (every status except stopping/stopped).
    pub fn worker_count(&self) -> usize {
        self.state().workers.len()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.state().workers.iter().map(|w| w.id).collect()
    }

    pub fn worker_status(&self, id: WorkerId) -> Option<WorkerStatus> {
        self.state()
            .workers
            .iter()
            .find(|w| w.id == id)
            .map(|w| w.status)
    }

    /// Register the in-process handler for `task_type`. Isolated workers run
    /// the same handlers on their own thread.
    pub fn register_handler<H>(&self, task_type: TaskType, handler: H)
    where
        H: TaskHandler + 'static,
    {
        info!(task_type = %task_type, "registering task handler");
        self.shared.handlers.insert(task_type, Arc::new(handler));
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.shared.handlers
    }

    /// Provision `min_workers` and start the health and auto-scale loops.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state();
            if state.running {
                debug!("worker pool already running");
                return Ok(());
            }
            state.running = true;
        }

        let config = &self.shared.config;
        info!(
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            execution = ?config.execution,
            auto_scale = config.auto_scale,
            "starting worker pool"
        );

        self.add_workers(config.min_workers, None).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = vec![spawn_loop(
            Arc::downgrade(&self.shared),
            config.health_check_interval,
            shutdown_rx.clone(),
            |pool| async move {
                pool.run_health_check().await;
            },
        )];
        if config.auto_scale {
            handles.push(spawn_loop(
                Arc::downgrade(&self.shared),
                config.scale_check_interval,
                shutdown_rx,
                |pool| async move {
                    pool.evaluate_scaling().await;
                },
            ));
        }

        let mut loops = self
            .shared
            .loops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *loops = Some(Loops { shutdown, handles });
        Ok(())
    }

    /// Stop both loops and gracefully terminate every worker. In-flight
    /// tasks are reported to their callers as failed.
    pub async fn stop(&self) -> Result<()> {
        let loops = self
            .shared
            .loops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(loops) = loops {
            let _ = loops.shutdown.send(true);
            for handle in loops.handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "pool supervision loop ended abnormally");
                }
            }
        }

        let mut workers = {
            let mut state = self.state();
            if !state.running {
                return Ok(());
            }
            state.running = false;
            std::mem::take(&mut state.workers)
        };
        info!(workers = workers.len(), "stopping worker pool");

        for worker in &mut workers {
            if let Some(interrupt) = worker.interrupt.take() {
                let mut err = WorkerError::new(WorkerError::SHUTDOWN, "worker pool is stopping")
                    .with_worker(worker.id);
                if let Some(task_id) = &worker.current_task {
                    err = err.with_task(task_id.clone());
                }
                let _ = interrupt.send(err);
            }
            if worker.status == WorkerStatus::Busy {
                worker.set_status(WorkerStatus::Error);
            }
            worker.set_status(WorkerStatus::Stopping);
        }

        self.shutdown_workers(workers).await;
        gauge!("ingest_workers").set(0.0);
        self.shared.idle.notify_waiters();
        info!("worker pool stopped");
        Ok(())
    }

    /// Create a worker and its execution unit. Not yet part of the pool.
    pub(crate) fn build_worker(&self, task_type: Option<TaskType>) -> Result<WorkerInstance> {
        let id = WorkerId::new_v4();
        let strategy =
            ExecutionStrategy::launch(self.shared.config.execution, id, &self.shared.handlers)?;
        let config = WorkerConfig {
            task_type,
            concurrency: 1,
            batch_size: task_type.map_or(1, |t| self.shared.batching.batch_size_for(t)),
            timeout: self.shared.config.worker_timeout,
        };
        Ok(WorkerInstance::new(id, config, strategy))
    }

    /// Add up to `count` workers without exceeding `max_workers`. Suspends
    /// until every new worker answered its first ping. Returns how many were
    /// added.
    pub async fn add_workers(&self, count: usize, task_type: Option<TaskType>) -> Result<usize> {
        let added: Vec<WorkerId> = {
            let mut state = self.state();
            if !state.running {
                return Err(IngestError::PoolNotRunning);
            }
            let room = self.shared.config.max_workers.saturating_sub(state.workers.len());
            let mut added = Vec::new();
            for _ in 0..count.min(room) {
                match self.build_worker(task_type) {
                    Ok(worker) => {
                        added.push(worker.id);
                        state.workers.push(worker);
                    }
                    Err(e) if added.is_empty() => return Err(e),
                    Err(e) => {
                        warn!(error = %e, "failed to create worker; continuing with fewer");
                        break;
                    }
                }
            }
            gauge!("ingest_workers").set(state.workers.len() as f64);
            added
        };

        for id in &added {
            info!(worker_id = %id, task_type = ?task_type, "worker started");
            self.shared.bus.publish(PipelineEvent::WorkerStarted(*id));
        }
        join_all(added.iter().map(|id| self.activate(*id))).await;
        Ok(added.len())
    }

    /// Bring a `Starting` worker to `Idle` once it answers a ping.
    pub(crate) async fn activate(&self, id: WorkerId) {
        let Some(strategy) = self
            .state()
            .worker_mut(id)
            .map(|w| w.strategy.clone())
        else {
            return;
        };

        let alive = strategy.ping(self.ping_timeout()).await;

        let mut state = self.state();
        let threshold = self.shared.config.restart_threshold;
        let Some(worker) = state.worker_mut(id) else {
            return;
        };
        if worker.status != WorkerStatus::Starting {
            return;
        }
        if alive {
            worker.set_status(WorkerStatus::Idle);
            drop(state);
            self.shared.idle.notify_waiters();
        } else {
            warn!(worker_id = %id, "new worker did not answer its first ping");
            worker.error_count = threshold;
            worker.set_status(WorkerStatus::Error);
        }
    }

    pub(crate) fn ping_timeout(&self) -> Duration {
        let config = &self.shared.config;
        config.worker_timeout.min(config.health_check_interval)
    }

    /// Remove up to `count` idle workers, never going below `min_workers`.
    /// Returns how many were removed.
    pub async fn remove_idle_workers(&self, count: usize) -> usize {
        let removed: Vec<WorkerInstance> = {
            let mut state = self.state();
            let removable = state
                .workers
                .len()
                .saturating_sub(self.shared.config.min_workers)
                .min(count);
            let mut removed = Vec::new();
            // Newest idle workers go first.
            while removed.len() < removable {
                let Some(idx) = state.workers.iter().rposition(|w| w.is_available()) else {
                    break;
                };
                let mut worker = state.workers.remove(idx);
                worker.set_status(WorkerStatus::Stopping);
                removed.push(worker);
            }
            gauge!("ingest_workers").set(state.workers.len() as f64);
            removed
        };

        let n = removed.len();
        if n > 0 {
            info!(removed = n, "removing idle workers");
            self.shutdown_workers(removed).await;
        }
        n
    }

    /// Bounded graceful shutdown of workers already in `Stopping`.
    pub(crate) async fn shutdown_workers(&self, workers: Vec<WorkerInstance>) {
        let grace = self.shared.config.shutdown_grace;
        let shutdowns = workers.into_iter().map(|mut worker| async move {
            let graceful = worker.strategy.shutdown(grace).await;
            worker.set_status(WorkerStatus::Stopped);
            if graceful {
                info!(worker_id = %worker.id, "worker stopped");
            } else {
                warn!(worker_id = %worker.id, "worker terminated after shutdown grace period");
            }
            self.shared.bus.publish(PipelineEvent::WorkerStopped(worker.id));
        });
        join_all(shutdowns).await;
    }
}

/// Periodic supervision loop. Exits when `shutdown` flips or the pool is
/// dropped.
fn spawn_loop<F, Fut>(
    pool: Weak<PoolShared>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(WorkerPool) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let Some(shared) = pool.upgrade() else {
                        break;
                    };
                    tick(WorkerPool { shared }).await;
                }
            }
        }
    })
}
