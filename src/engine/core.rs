// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous, deterministic "core runtime" that
//! consumes [`EngineEvent`]s and produces:
//! - an updated core state
//! - a list of commands describing what the IO shell should do next
//!
//! The async shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - feeding enqueued tasks to the batch accumulator
//! - running batches on the worker pool
//! - arming retry timers and handling Ctrl+C
//!
//! The core is unit tested without any Tokio, channels or workers.

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::dag::{Admission, DagBuilder, DagCounts, DependencyDag};
use crate::engine::retry::RetryPolicy;
use crate::engine::{CoreCommand, CoreStep, EngineEvent, RuntimeOptions, TaskOutcome};
use crate::events::PipelineEvent;
use crate::queue::{DepthProbe, TaskQueue};
use crate::types::{ChangeEvent, ChangeFragment, TaskType};

/// Running totals kept by the core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStats {
    pub events_accepted: u64,
    pub events_rejected: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
}

/// Pure core runtime state.
///
/// This owns:
/// - the dependency DAG and the builder feeding it
/// - the task queue between the DAG and the batch accumulator
/// - the retry policy
///
/// It has no channels, no Tokio types, and does not perform any IO.
#[derive(Debug)]
pub struct CoreRuntime {
    dag: DependencyDag,
    queue: TaskQueue,
    builder: DagBuilder,
    retry: RetryPolicy,
    options: RuntimeOptions,
    /// Most tasks handed to the shell and not yet reported back.
    dispatch_budget: usize,
    in_flight: usize,
    input_closed: bool,
    stats: CoreStats,
}

impl CoreRuntime {
    pub fn new(config: &ConfigFile, options: RuntimeOptions) -> Self {
        let largest_batch = TaskType::ALL
            .iter()
            .map(|t| config.batching.batch_size_for(*t))
            .max()
            .unwrap_or(1);
        Self {
            dag: DependencyDag::new(config.retry.failure_policy),
            queue: TaskQueue::new(config.queue.max_size),
            builder: DagBuilder::new(config.retry.max_retries),
            retry: RetryPolicy::from(&config.retry),
            options,
            dispatch_budget: (config.batching.max_concurrent_batches * largest_batch).max(1),
            in_flight: 0,
            input_closed: false,
            stats: CoreStats::default(),
        }
    }

    pub fn dag(&self) -> &DependencyDag {
        &self.dag
    }

    /// Depth of the internal task queue, for the queue-depth load estimator.
    pub fn queue_probe(&self) -> DepthProbe {
        self.queue.probe()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn stats(&self) -> CoreStats {
        self.stats
    }

    /// Nothing queued, nothing in flight and no DAG node that could still run.
    pub fn is_drained(&self) -> bool {
        self.in_flight == 0 && self.queue.is_empty() && self.dag.is_drained()
    }

    /// Handle a single engine event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: EngineEvent) -> CoreStep {
        self.step_at(event, Utc::now())
    }

    /// [`CoreRuntime::step`] with an explicit clock, for deterministic tests.
    pub fn step_at(&mut self, event: EngineEvent, now: DateTime<Utc>) -> CoreStep {
        let mut commands = Vec::new();
        match event {
            EngineEvent::Submit { event, fragments } => {
                self.submit(&event, &fragments, &mut commands);
            }
            EngineEvent::BatchFinished { outcomes } => {
                self.settle(outcomes, now, &mut commands);
            }
            EngineEvent::RetryDue => {}
            EngineEvent::InputClosed => {
                debug!("input closed");
                self.input_closed = true;
            }
            EngineEvent::ShutdownRequested => {
                return CoreStep {
                    commands,
                    keep_running: false,
                };
            }
        }

        let keep_running = self.pump(now, &mut commands);
        CoreStep {
            commands,
            keep_running,
        }
    }

    fn submit(&mut self, event: &ChangeEvent, fragments: &[ChangeFragment], commands: &mut Vec<CoreCommand>) {
        let dag = &self.dag;
        let nodes = match self.builder.build(event, fragments, |id| {
            dag.status_of(id).is_some_and(|s| !s.is_terminal())
        }) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "rejecting change event");
                self.stats.events_rejected += 1;
                return;
            }
        };

        let counts = self.dag.counts();
        let live = counts.pending + counts.processing + self.dag.superseded_len();
        let max_size = self.queue.max_size();
        if live + nodes.len() > max_size {
            warn!(
                event_id = %event.id,
                live,
                incoming = nodes.len(),
                max_size,
                "ingestion backlog full; rejecting change event"
            );
            counter!("ingest_queue_overflow").increment(1);
            commands.push(CoreCommand::Publish(PipelineEvent::QueueOverflow { max_size }));
            self.stats.events_rejected += 1;
            return;
        }

        debug!(event_id = %event.id, file = %event.file_path, nodes = nodes.len(), "accepting change event");
        for node in nodes {
            let id = node.id().to_string();
            if self.dag.add_node(node) == Admission::Deferred {
                debug!(event_id = %event.id, node = %id, "node in flight; newer payload runs after it settles");
            }
        }
        self.stats.events_accepted += 1;
    }

    fn settle(&mut self, outcomes: Vec<TaskOutcome>, now: DateTime<Utc>, commands: &mut Vec<CoreCommand>) {
        for outcome in outcomes {
            self.in_flight = self.in_flight.saturating_sub(1);
            let id = outcome.task.id.clone();

            let Some(err) = outcome.error else {
                let unblocked = self.dag.mark_completed(&id);
                if !unblocked.is_empty() {
                    debug!(node = %id, unblocked = ?unblocked, "task completed; dependents ready");
                }
                self.stats.tasks_completed += 1;
                continue;
            };

            if self.retry.should_retry(&outcome.task, &err) {
                let next = self.retry.next_attempt(&outcome.task, now);
                info!(
                    task_id = %id,
                    attempt = next.retry_count,
                    code = err.code,
                    "task failed; scheduling retry"
                );
                match self.queue.push(next) {
                    Ok(()) => {
                        self.stats.tasks_retried += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "could not requeue task for retry");
                        commands.push(CoreCommand::Publish(PipelineEvent::QueueOverflow {
                            max_size: self.queue.max_size(),
                        }));
                    }
                }
            }

            let failed = self.dag.mark_failed(&id);
            warn!(
                task_id = %id,
                code = err.code,
                error = %err.message,
                retries = outcome.task.retry_count,
                failed = ?failed,
                "task failed permanently"
            );
            self.stats.tasks_failed += failed.len() as u64;
        }
        self.dag.prune_completed();
    }

    /// Move ready work forward and decide whether to keep running.
    fn pump(&mut self, now: DateTime<Utc>, commands: &mut Vec<CoreCommand>) -> bool {
        let room = self.queue.max_size().saturating_sub(self.queue.len());
        for task in self.dag.start_ready(Some(room)) {
            let id = task.id.clone();
            if let Err(e) = self.queue.push(task) {
                warn!(task_id = %id, error = %e, "task queue full; leaving node pending");
                self.dag.reset_to_pending(&id);
            }
        }

        let budget = self.dispatch_budget.saturating_sub(self.in_flight);
        let mut dispatch = Vec::new();
        while dispatch.len() < budget {
            match self.queue.pop_ready(now) {
                Some(task) => dispatch.push(task),
                None => break,
            }
        }
        if !dispatch.is_empty() {
            self.in_flight += dispatch.len();
            commands.push(CoreCommand::Enqueue(dispatch));
        }

        if let Some(at) = self.queue.next_due() {
            commands.push(CoreCommand::WakeAt(at));
        }

        let cycles = self.dag.check_progress();
        if !cycles.is_empty() {
            commands.push(CoreCommand::Publish(PipelineEvent::CyclesDetected(cycles)));
        }

        if self.options.exit_when_drained && self.input_closed && self.is_drained() {
            let DagCounts { pending, cyclic, failed, .. } = self.dag.counts();
            info!(
                completed = self.stats.tasks_completed,
                failed = self.stats.tasks_failed,
                blocked = pending + cyclic,
                failed_nodes = failed,
                "pipeline drained"
            );
            commands.push(CoreCommand::RequestExit);
            return false;
        }
        true
    }
}
