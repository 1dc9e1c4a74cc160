// src/worker/isolated.rs

//! Isolated execution unit: a dedicated OS thread with its own
//! single-threaded Tokio runtime, reached only through messages.
//!
//! Protocol (correlated strictly by `task_id`):
//! - `ping` -> `pong`
//! - `task { task_id, payload, metadata }` -> `task_result { task_id, .. }`
//! - `shutdown` -> `shutdown_complete`
//! - `error { task_id?, error }` for faults outside a task result
//!
//! Replies for a task nobody waits for anymore (the caller timed out or the
//! worker was restarted) are dropped.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::errors::WorkerError;
use crate::types::{Metadata, TaskId, TaskPayload};
use crate::worker::handler::HandlerRegistry;
use crate::worker::{panic_message, WorkerId};

/// Message sent to an isolated worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ping,
    Task {
        task_id: TaskId,
        payload: TaskPayload,
        metadata: Metadata,
    },
    Shutdown,
}

/// Message sent back by an isolated worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    Pong,
    TaskResult {
        task_id: TaskId,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
        duration_ms: u64,
    },
    ShutdownComplete,
    Error {
        #[serde(default)]
        task_id: Option<TaskId>,
        error: String,
    },
}

/// Completed task as seen by the waiting caller.
#[derive(Debug)]
enum TaskReply {
    Done(Value),
    /// The handler returned an error.
    Failed(String),
    /// The task ended outside a normal result (handler panic).
    Faulted(String),
}

#[derive(Debug, Default)]
struct Waiters {
    /// task id -> (dispatch nonce, reply slot)
    tasks: HashMap<TaskId, (u64, oneshot::Sender<TaskReply>)>,
    pings: VecDeque<oneshot::Sender<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct Shared {
    worker_id: WorkerId,
    handlers: HandlerRegistry,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    waiters: Mutex<Waiters>,
    alive: AtomicBool,
    next_nonce: AtomicU64,
}

impl Shared {
    fn waiters(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Pool-side handle to an isolated worker thread.
#[derive(Debug, Clone)]
pub struct IsolatedHandle {
    shared: Arc<Shared>,
}

/// Removes the task's reply slot if the caller stops waiting.
struct PendingGuard<'a> {
    shared: &'a Shared,
    task_id: TaskId,
    nonce: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut waiters = self.shared.waiters();
        if waiters
            .tasks
            .get(&self.task_id)
            .is_some_and(|(nonce, _)| *nonce == self.nonce)
        {
            waiters.tasks.remove(&self.task_id);
        }
    }
}

impl IsolatedHandle {
    /// Spawn the worker thread and the reply router. Must be called from
    /// within a Tokio runtime.
    pub fn spawn(worker_id: WorkerId, handlers: HandlerRegistry) -> std::io::Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<WorkerReply>();

        let short = worker_id.simple().to_string();
        let thread_handlers = handlers.clone();
        std::thread::Builder::new()
            .name(format!("ingest-worker-{}", &short[..8]))
            .spawn(move || worker_thread_main(worker_id, cmd_rx, reply_tx, thread_handlers))?;

        let shared = Arc::new(Shared {
            worker_id,
            handlers,
            tx: cmd_tx,
            waiters: Mutex::new(Waiters::default()),
            alive: AtomicBool::new(true),
            next_nonce: AtomicU64::new(0),
        });

        tokio::spawn(route_replies(Arc::clone(&shared), reply_rx));

        Ok(Self { shared })
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    fn crashed(&self, task_id: &str, message: &str) -> WorkerError {
        WorkerError::new(WorkerError::CRASHED, message)
            .with_worker(self.shared.worker_id)
            .with_task(task_id)
    }

    pub async fn execute(&self, task: TaskPayload) -> std::result::Result<Value, WorkerError> {
        let task_id = task.id.clone();
        if !self.is_alive() {
            return Err(self.crashed(&task_id, "isolated worker is not running"));
        }
        if !self.shared.handlers.contains(task.task_type) {
            return Err(WorkerError::task_failed(format!(
                "no handler registered for task type {}",
                task.task_type
            ))
            .with_worker(self.shared.worker_id)
            .with_task(task_id)
            .non_retryable());
        }

        let nonce = self.shared.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .waiters()
            .tasks
            .insert(task_id.clone(), (nonce, tx));
        let _guard = PendingGuard {
            shared: &self.shared,
            task_id: task_id.clone(),
            nonce,
        };

        let message = WorkerMessage::Task {
            task_id: task_id.clone(),
            metadata: task.metadata.clone(),
            payload: task,
        };
        if self.shared.tx.send(message).is_err() {
            return Err(self.crashed(&task_id, "isolated worker channel closed"));
        }

        match rx.await {
            Ok(TaskReply::Done(value)) => Ok(value),
            Ok(TaskReply::Failed(message)) => Err(WorkerError::task_failed(message)
                .with_worker(self.shared.worker_id)
                .with_task(task_id)),
            Ok(TaskReply::Faulted(message)) => Err(self.crashed(&task_id, &message)),
            Err(_) => Err(self.crashed(&task_id, "isolated worker exited while running task")),
        }
    }

    /// Liveness probe. A worker busy with a task answers only once the task
    /// is done.
    pub async fn ping(&self, timeout: Duration) -> bool {
        if !self.is_alive() {
            return false;
        }
        let (tx, rx) = oneshot::channel();
        self.shared.waiters().pings.push_back(tx);
        if self.shared.tx.send(WorkerMessage::Ping).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }

    /// Ask the thread to exit and wait up to `grace` for the acknowledgement.
    ///
    /// Returns false if the thread did not acknowledge in time. It is then
    /// detached: with its command channel gone it exits after finishing
    /// whatever it is running.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if !self.is_alive() {
            return true;
        }
        let (tx, rx) = oneshot::channel();
        self.shared.waiters().shutdown = Some(tx);
        if self.shared.tx.send(WorkerMessage::Shutdown).is_err() {
            return true;
        }
        match tokio::time::timeout(grace, rx).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    worker_id = %self.shared.worker_id,
                    grace_ms = grace.as_millis() as u64,
                    "isolated worker did not acknowledge shutdown; detaching thread"
                );
                false
            }
        }
    }
}

async fn route_replies(shared: Arc<Shared>, mut replies: mpsc::UnboundedReceiver<WorkerReply>) {
    while let Some(reply) = replies.recv().await {
        match reply {
            WorkerReply::Pong => {
                let mut waiters = shared.waiters();
                while let Some(tx) = waiters.pings.pop_front() {
                    if tx.send(()).is_ok() {
                        break;
                    }
                }
            }
            WorkerReply::TaskResult {
                task_id,
                success,
                result,
                error,
                duration_ms,
            } => {
                let slot = shared.waiters().tasks.remove(&task_id);
                let Some((_, tx)) = slot else {
                    debug!(worker_id = %shared.worker_id, task_id = %task_id, "dropping stale task result");
                    continue;
                };
                debug!(worker_id = %shared.worker_id, task_id = %task_id, success, duration_ms, "task result received");
                let reply = if success {
                    TaskReply::Done(result.unwrap_or(Value::Null))
                } else {
                    TaskReply::Failed(error.unwrap_or_else(|| "task failed".to_string()))
                };
                let _ = tx.send(reply);
            }
            WorkerReply::ShutdownComplete => {
                if let Some(tx) = shared.waiters().shutdown.take() {
                    let _ = tx.send(());
                }
            }
            WorkerReply::Error { task_id, error } => match task_id {
                Some(task_id) => {
                    if let Some((_, tx)) = shared.waiters().tasks.remove(&task_id) {
                        let _ = tx.send(TaskReply::Faulted(error));
                    }
                }
                None => warn!(worker_id = %shared.worker_id, %error, "isolated worker reported an error"),
            },
        }
    }

    // The thread is gone; fail everyone still waiting by dropping their slots.
    shared.alive.store(false, Ordering::Release);
    let mut waiters = shared.waiters();
    waiters.tasks.clear();
    waiters.pings.clear();
    if let Some(tx) = waiters.shutdown.take() {
        let _ = tx.send(());
    }
    debug!(worker_id = %shared.worker_id, "isolated worker reply channel closed");
}

fn worker_thread_main(
    worker_id: WorkerId,
    mut commands: mpsc::UnboundedReceiver<WorkerMessage>,
    replies: mpsc::UnboundedSender<WorkerReply>,
    handlers: HandlerRegistry,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker_id = %worker_id, error = %e, "failed to build isolated worker runtime");
            let _ = replies.send(WorkerReply::Error {
                task_id: None,
                error: format!("failed to build runtime: {e}"),
            });
            return;
        }
    };

    runtime.block_on(async move {
        info!(worker_id = %worker_id, "isolated worker thread started");
        while let Some(message) = commands.recv().await {
            let reply = match message {
                WorkerMessage::Ping => WorkerReply::Pong,
                WorkerMessage::Task {
                    task_id, payload, ..
                } => run_task(&handlers, task_id, payload).await,
                WorkerMessage::Shutdown => {
                    let _ = replies.send(WorkerReply::ShutdownComplete);
                    break;
                }
            };
            if replies.send(reply).is_err() {
                break;
            }
        }
        info!(worker_id = %worker_id, "isolated worker thread exiting");
    });
}

async fn run_task(handlers: &HandlerRegistry, task_id: TaskId, payload: TaskPayload) -> WorkerReply {
    let Some(handler) = handlers.get(payload.task_type) else {
        return WorkerReply::Error {
            error: format!("no handler registered for task type {}", payload.task_type),
            task_id: Some(task_id),
        };
    };

    let started = Instant::now();
    let outcome = AssertUnwindSafe(handler.handle(payload)).catch_unwind().await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(result)) => WorkerReply::TaskResult {
            task_id,
            success: true,
            result: Some(result),
            error: None,
            duration_ms,
        },
        Ok(Err(err)) => WorkerReply::TaskResult {
            task_id,
            success: false,
            result: None,
            error: Some(format!("{err:#}")),
            duration_ms,
        },
        Err(panic) => WorkerReply::Error {
            task_id: Some(task_id),
            error: format!("handler panicked: {}", panic_message(&*panic)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn protocol_messages_are_tagged() {
        let ping = serde_json::to_value(WorkerMessage::Ping).unwrap();
        assert_eq!(ping, json!({"type": "ping"}));

        let reply: WorkerReply = serde_json::from_value(json!({
            "type": "task_result",
            "task_id": "t1",
            "success": false,
            "error": "boom",
            "duration_ms": 3
        }))
        .unwrap();
        assert_eq!(
            reply,
            WorkerReply::TaskResult {
                task_id: "t1".into(),
                success: false,
                result: None,
                error: Some("boom".into()),
                duration_ms: 3,
            }
        );
    }
}
