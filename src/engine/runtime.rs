// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchAccumulator, BatchResult};
use crate::config::BatchingConfig;
use crate::errors::{BatchProcessingError, Result, WorkerError};
use crate::events::{EventBus, PipelineEvent};
use crate::pool::WorkerPool;

use super::core::CoreRuntime;
use super::{CoreCommand, EngineEvent, TaskOutcome};

/// Capacity of the engine's inbound event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Drives the core runtime in response to [`EngineEvent`]s and runs the
/// resulting batches on a [`WorkerPool`].
///
/// This is a pure IO shell around [`CoreRuntime`], which contains all the
/// scheduling semantics. It handles async IO: reading events from the
/// channel, feeding the batch accumulator, running at most
/// `max_concurrent_batches` batches at a time and arming retry timers.
pub struct Runtime {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<EngineEvent>,
    event_tx: mpsc::Sender<EngineEvent>,
    pool: WorkerPool,
    bus: EventBus,
    accumulator: BatchAccumulator,
    batches: mpsc::UnboundedReceiver<Batch>,
    permits: Arc<Semaphore>,
    running: JoinSet<()>,
    next_wake: Option<DateTime<Utc>>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Build the shell. Must be called from within a Tokio runtime. Returns
    /// the sender producers use to submit events.
    pub fn new(
        core: CoreRuntime,
        pool: WorkerPool,
        batching: BatchingConfig,
    ) -> Result<(Self, mpsc::Sender<EngineEvent>)> {
        let bus = pool.event_bus().clone();
        let permits = Arc::new(Semaphore::new(batching.max_concurrent_batches.max(1)));
        let (accumulator, batches) = BatchAccumulator::new(batching, bus.clone())?;
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Ok((
            Self {
                core,
                event_rx,
                event_tx: event_tx.clone(),
                pool,
                bus,
                accumulator,
                batches,
                permits,
                running: JoinSet::new(),
                next_wake: None,
            },
            event_tx,
        ))
    }

    /// Main event loop.
    ///
    /// - Consumes [`EngineEvent`]s and flushed batches.
    /// - Feeds events into the core and executes its commands.
    /// - Returns the core once it requested exit or shutdown was requested.
    pub async fn run(mut self) -> Result<CoreRuntime> {
        info!("ingestflow runtime started");

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    // `event_tx` is held by the runtime itself, so `None`
                    // cannot happen while the loop runs.
                    let Some(event) = event else { break };
                    if !self.handle_event(event) {
                        break;
                    }
                }
                Some(batch) = self.batches.recv() => {
                    self.spawn_batch(batch);
                }
                Some(joined) = self.running.join_next(), if !self.running.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "batch task ended abnormally");
                    }
                }
            }
        }

        if !self.running.is_empty() {
            info!(batches = self.running.len(), "abandoning in-flight batches");
            self.running.shutdown().await;
        }
        info!("runtime exiting");
        Ok(self.core)
    }

    fn handle_event(&mut self, event: EngineEvent) -> bool {
        if matches!(event, EngineEvent::RetryDue) {
            self.next_wake = None;
        }
        debug!(?event, "runtime received event");

        let step = self.core.step(event);
        for command in step.commands {
            self.execute_command(command);
        }
        if !step.keep_running {
            info!("core requested exit; stopping runtime");
        }
        step.keep_running
    }

    /// Execute a single command from the core.
    fn execute_command(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::Enqueue(tasks) => {
                debug!(tasks = tasks.len(), "enqueueing ready tasks");
                self.accumulator.add_all(tasks);
            }
            CoreCommand::WakeAt(at) => self.arm_wake(at),
            CoreCommand::Publish(event) => self.bus.publish(event),
            CoreCommand::RequestExit => {
                // keep_running is already false; drain whatever is buffered.
                self.accumulator.flush_all();
            }
        }
    }

    fn arm_wake(&mut self, at: DateTime<Utc>) {
        if self.next_wake.is_some_and(|armed| armed <= at) {
            return;
        }
        self.next_wake = Some(at);
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineEvent::RetryDue).await;
        });
    }

    fn spawn_batch(&mut self, batch: Batch) {
        let pool = self.pool.clone();
        let bus = self.bus.clone();
        let permits = Arc::clone(&self.permits);
        let tx = self.event_tx.clone();

        self.running.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let outcomes = run_batch(&pool, &bus, batch).await;
            let _ = tx.send(EngineEvent::BatchFinished { outcomes }).await;
        });
    }
}

/// Execute one batch on the pool and publish its result.
async fn run_batch(pool: &WorkerPool, bus: &EventBus, batch: Batch) -> Vec<TaskOutcome> {
    let Batch { metadata, tasks } = batch;
    let started = Instant::now();
    debug!(batch_id = %metadata.id, batch_type = %metadata.batch_type, size = tasks.len(), "running batch");

    let results = pool.submit_all(tasks.clone()).await;

    let mut outcomes = Vec::with_capacity(tasks.len());
    let mut errors = Vec::new();
    for (task, result) in tasks.into_iter().zip(results) {
        let error = match result {
            Ok(r) if r.success => None,
            Ok(r) => Some(r.error.unwrap_or_else(|| {
                WorkerError::task_failed("task failed without an error").with_task(task.id.clone())
            })),
            Err(e) => {
                let mut err = WorkerError::new(e.code(), e.to_string()).with_task(task.id.clone());
                err.retryable = e.retryable();
                Some(err)
            }
        };
        match error {
            None => outcomes.push(TaskOutcome::success(task)),
            Some(err) => {
                errors.push(err.clone());
                outcomes.push(TaskOutcome::failure(task, err));
            }
        }
    }

    let result = BatchResult {
        processed_count: outcomes.len() - errors.len(),
        failed_count: errors.len(),
        duration: started.elapsed(),
        metadata,
        errors,
    };

    if result.is_success() {
        debug!(batch_id = %result.metadata.id, elapsed_ms = result.duration.as_millis() as u64, "batch completed");
        bus.publish(PipelineEvent::BatchCompleted(result));
    } else {
        let error = BatchProcessingError {
            batch_id: result.metadata.id.clone(),
            total: result.metadata.size,
            failed_items: result.failed_items(),
            retryable: result.errors.iter().all(|e| e.retryable),
            metadata: Default::default(),
        };
        warn!(batch_id = %error.batch_id, failed = result.failed_count, total = error.total, "batch had failures");
        bus.publish(PipelineEvent::BatchFailed { result, error });
    }

    outcomes
}
