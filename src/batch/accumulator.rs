// src/batch/accumulator.rs

//! Groups tasks by type and flushes them as batches, either when a group
//! reaches its configured size or when its timer fires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::batch::metadata::{Batch, BatchMetadata};
use crate::config::BatchingConfig;
use crate::errors::{IngestError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::types::{TaskPayload, TaskType};

/// Tasks waiting for one type group to flush.
#[derive(Debug, Default)]
struct Group {
    tasks: Vec<TaskPayload>,
    /// Bumped on every flush; a timer only flushes the generation it was
    /// armed for.
    generation: u64,
}

#[derive(Debug)]
struct Inner {
    groups: HashMap<TaskType, Group>,
    config: BatchingConfig,
    out: mpsc::UnboundedSender<Batch>,
    bus: EventBus,
}

impl Inner {
    /// Take the group's tasks and emit them as one batch.
    fn flush(&mut self, task_type: TaskType, reason: &'static str) {
        let Some(group) = self.groups.get_mut(&task_type) else {
            return;
        };
        if group.tasks.is_empty() {
            return;
        }
        group.generation += 1;
        let tasks = std::mem::take(&mut group.tasks);

        let metadata = BatchMetadata::describe(task_type, &tasks);
        debug!(
            batch_id = %metadata.id,
            batch_type = %task_type,
            size = metadata.size,
            reason,
            "batch created"
        );
        counter!("ingest_batches_created", "type" => task_type.as_str()).increment(1);

        self.bus.publish(PipelineEvent::BatchCreated(metadata.clone()));
        if self.out.send(Batch { metadata, tasks }).is_err() {
            trace!(batch_type = %task_type, "batch receiver dropped; batch discarded");
        }
    }
}

/// Accumulates tasks into per-type batches.
///
/// `add` never blocks on the flush timer: the timer for a group is a separate
/// Tokio task armed when the group receives its first task. Emitted batches
/// go to the receiver returned by [`BatchAccumulator::new`] and are announced
/// as [`PipelineEvent::BatchCreated`].
#[derive(Debug, Clone)]
pub struct BatchAccumulator {
    inner: Arc<Mutex<Inner>>,
    handle: Handle,
}

impl BatchAccumulator {
    /// Must be called from within a Tokio runtime; the timers run on it.
    pub fn new(
        config: BatchingConfig,
        bus: EventBus,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Batch>)> {
        let handle = Handle::try_current().map_err(|e| {
            IngestError::ingestion(
                "NO_RUNTIME",
                format!("batch accumulator needs a Tokio runtime: {e}"),
            )
        })?;
        let (out, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            groups: HashMap::new(),
            config,
            out,
            bus,
        };
        Ok((
            Self {
                inner: Arc::new(Mutex::new(inner)),
                handle,
            },
            rx,
        ))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add one task to its type group.
    pub fn add(&self, task: TaskPayload) {
        let task_type = task.task_type;
        let mut inner = self.lock();
        let batch_size = inner.config.batch_size_for(task_type);
        let timeout = inner.config.timeout();

        let group = inner.groups.entry(task_type).or_default();
        let first_in_group = group.tasks.is_empty();
        group.tasks.push(task);
        let generation = group.generation;
        let len = group.tasks.len();

        if len >= batch_size {
            inner.flush(task_type, "size");
        } else if first_in_group {
            self.arm_timer(task_type, generation, timeout);
        }
    }

    pub fn add_all<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = TaskPayload>,
    {
        for task in tasks {
            self.add(task);
        }
    }

    fn arm_timer(&self, task_type: TaskType, generation: u64, timeout: Duration) {
        let inner = Arc::clone(&self.inner);
        self.handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let armed_for_current = inner
                .groups
                .get(&task_type)
                .is_some_and(|g| g.generation == generation);
            if armed_for_current {
                inner.flush(task_type, "timeout");
            }
        });
    }

    /// Flush every non-empty group right away.
    pub fn flush_all(&self) {
        let mut inner = self.lock();
        for task_type in TaskType::ALL {
            inner.flush(task_type, "drain");
        }
    }

    /// Tasks accepted but not yet emitted in a batch.
    pub fn pending_len(&self) -> usize {
        self.lock().groups.values().map(|g| g.tasks.len()).sum()
    }
}
