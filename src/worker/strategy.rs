// src/worker/strategy.rs

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;

use crate::errors::{IngestError, Result, WorkerError};
use crate::types::{ExecutionMode, TaskPayload};
use crate::worker::handler::HandlerRegistry;
use crate::worker::isolated::IsolatedHandle;
use crate::worker::{panic_message, WorkerId};

/// How a worker runs its tasks. Chosen when the worker is created; both
/// variants satisfy the same `execute` contract, so the pool never branches
/// on it.
#[derive(Debug, Clone)]
pub enum ExecutionStrategy {
    /// Direct call of the registered handler.
    InProcess(HandlerRegistry),
    /// Message passing with a dedicated worker thread.
    Isolated(IsolatedHandle),
}

impl ExecutionStrategy {
    pub fn launch(mode: ExecutionMode, worker_id: WorkerId, handlers: &HandlerRegistry) -> Result<Self> {
        match mode {
            ExecutionMode::InProcess => Ok(ExecutionStrategy::InProcess(handlers.clone())),
            ExecutionMode::Isolated => IsolatedHandle::spawn(worker_id, handlers.clone())
                .map(ExecutionStrategy::Isolated)
                .map_err(IngestError::from),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        match self {
            ExecutionStrategy::InProcess(_) => ExecutionMode::InProcess,
            ExecutionStrategy::Isolated(_) => ExecutionMode::Isolated,
        }
    }

    /// Run one task to completion. Handler errors and panics come back as
    /// [`WorkerError`]s; nothing escapes as a panic.
    pub async fn execute(
        &self,
        worker_id: WorkerId,
        task: TaskPayload,
    ) -> std::result::Result<Value, WorkerError> {
        match self {
            ExecutionStrategy::InProcess(handlers) => {
                let task_id = task.id.clone();
                let Some(handler) = handlers.get(task.task_type) else {
                    return Err(WorkerError::task_failed(format!(
                        "no handler registered for task type {}",
                        task.task_type
                    ))
                    .with_worker(worker_id)
                    .with_task(task_id)
                    .non_retryable());
                };

                match AssertUnwindSafe(handler.handle(task)).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(WorkerError::task_failed(format!("{err:#}"))
                        .with_worker(worker_id)
                        .with_task(task_id)),
                    Err(panic) => Err(WorkerError::new(
                        WorkerError::CRASHED,
                        format!("handler panicked: {}", panic_message(&*panic)),
                    )
                    .with_worker(worker_id)
                    .with_task(task_id)),
                }
            }
            ExecutionStrategy::Isolated(handle) => handle.execute(task).await,
        }
    }

    pub async fn ping(&self, timeout: Duration) -> bool {
        match self {
            ExecutionStrategy::InProcess(_) => true,
            ExecutionStrategy::Isolated(handle) => handle.ping(timeout).await,
        }
    }

    /// Graceful shutdown with a bounded wait. Returns false when the
    /// execution unit had to be abandoned.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        match self {
            ExecutionStrategy::InProcess(_) => true,
            ExecutionStrategy::Isolated(handle) => handle.shutdown(grace).await,
        }
    }
}
