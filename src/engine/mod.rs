// src/engine/mod.rs

//! Orchestration engine.
//!
//! This module ties together:
//! - the dependency DAG built from change fragments
//! - the task queue (priority order, delayed retries, backpressure)
//! - the batch accumulator and the worker pool
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`].

use chrono::{DateTime, Utc};

use crate::errors::WorkerError;
use crate::events::PipelineEvent;
use crate::types::{ChangeEvent, ChangeFragment, TaskPayload};

pub mod core;
pub mod retry;
pub mod runtime;

pub use core::CoreRuntime;
pub use retry::RetryPolicy;
pub use runtime::Runtime;

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// Exit once the input is closed and the DAG is drained (`--once`).
    pub exit_when_drained: bool,
}

/// How one task of a finished batch ended.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// The task as it was dispatched, including its retry count.
    pub task: TaskPayload,
    pub error: Option<WorkerError>,
}

impl TaskOutcome {
    pub fn success(task: TaskPayload) -> Self {
        Self { task, error: None }
    }

    pub fn failure(task: TaskPayload, error: WorkerError) -> Self {
        Self {
            task,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Events flowing into the engine from producers, the pool and timers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// One change event and the fragments decomposed from it.
    Submit {
        event: ChangeEvent,
        fragments: Vec<ChangeFragment>,
    },
    /// Every task of one batch has settled.
    BatchFinished { outcomes: Vec<TaskOutcome> },
    /// A delayed retry may have become due.
    RetryDue,
    /// No more submissions will arrive.
    InputClosed,
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Hand these tasks to the batch accumulator.
    Enqueue(Vec<TaskPayload>),
    /// Send [`EngineEvent::RetryDue`] at this instant.
    WakeAt(DateTime<Utc>),
    /// Publish on the pipeline event bus.
    Publish(PipelineEvent),
    /// Everything is drained; the shell should exit.
    RequestExit,
}

/// Decision returned by the core after handling a single [`EngineEvent`].
#[derive(Debug, Clone)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    pub keep_running: bool,
}
