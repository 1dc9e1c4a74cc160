#![allow(dead_code)]

//! Task handlers for exercising the pool and engine without a real graph
//! store.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use ingestflow::types::TaskPayload;
use ingestflow::worker::TaskHandler;
use serde_json::{json, Value};

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'a>>;

/// Records the id of every task it runs, optionally after a delay.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            seen: Arc::default(),
            delay: Some(delay),
        }
    }

    /// Task ids in completion order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl TaskHandler for RecordingHandler {
    fn handle(&self, task: TaskPayload) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().unwrap().push(task.id.clone());
            Ok(json!({ "id": task.id }))
        })
    }
}

/// Fails the first `failures` attempts of every task, then succeeds.
#[derive(Clone)]
pub struct FlakyHandler {
    failures: u32,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: Arc::default(),
        }
    }

    pub fn attempts(&self, task_id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }
}

impl TaskHandler for FlakyHandler {
    fn handle(&self, task: TaskPayload) -> HandlerFuture<'_> {
        Box::pin(async move {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let n = attempts.entry(task.id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            if attempt <= self.failures {
                Err(anyhow!("transient failure {attempt} for {}", task.id))
            } else {
                Ok(json!({ "id": task.id, "attempt": attempt }))
            }
        })
    }
}

/// Always fails.
#[derive(Clone, Default)]
pub struct FailingHandler {
    calls: Arc<AtomicU32>,
}

impl FailingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TaskHandler for FailingHandler {
    fn handle(&self, task: TaskPayload) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("handler rejected {}", task.id))
        })
    }
}

/// Blocks its thread with `std::thread::sleep`, ignoring cancellation the
/// way a CPU-bound handler would.
#[derive(Clone)]
pub struct BlockingHandler {
    duration: Duration,
}

impl BlockingHandler {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl TaskHandler for BlockingHandler {
    fn handle(&self, task: TaskPayload) -> HandlerFuture<'_> {
        let duration = self.duration;
        Box::pin(async move {
            std::thread::sleep(duration);
            Ok(json!({ "id": task.id }))
        })
    }
}

/// Key/value store written by the task's natural key. Re-running a task
/// overwrites the same entry, so a store written by retried tasks ends up
/// identical to one written once.
#[derive(Clone, Default)]
pub struct KeyedStore {
    entries: Arc<Mutex<HashMap<String, Value>>>,
    writes: Arc<AtomicU32>,
}

impl KeyedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    /// A handler that writes `task.data` under `task.id`, then fails the
    /// first `failures` attempts after the write.
    pub fn writer(&self, failures: u32) -> StoreWriter {
        StoreWriter {
            store: self.clone(),
            failures_left: Arc::new(AtomicU32::new(failures)),
        }
    }
}

#[derive(Clone)]
pub struct StoreWriter {
    store: KeyedStore,
    failures_left: Arc<AtomicU32>,
}

impl TaskHandler for StoreWriter {
    fn handle(&self, task: TaskPayload) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.store
                .entries
                .lock()
                .unwrap()
                .insert(task.id.clone(), task.data.clone());
            self.store.writes.fetch_add(1, Ordering::SeqCst);

            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                Err(anyhow!("connection reset after writing {}", task.id))
            } else {
                Ok(Value::Null)
            }
        })
    }
}
