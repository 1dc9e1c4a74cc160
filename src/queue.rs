// src/queue.rs

//! Bounded in-memory task queue.
//!
//! Semantics:
//! - `push` refuses new tasks once `max_size` is reached and reports a
//!   non-retryable [`IngestError::QueueOverflow`]; producers must shed load.
//!   The owner publishes `queue:overflow`.
//! - `pop_ready` returns the highest-priority task that is due, FIFO among
//!   equal priorities.
//! - Tasks carrying a future `scheduled_at` (retries waiting out their
//!   backoff) stay queued until due but still count towards `max_size`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tracing::warn;

use crate::errors::{IngestError, Result};
use crate::types::TaskPayload;

#[derive(Debug)]
struct Entry {
    task: TaskPayload,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Shared, read-only view of a queue's depth, used by the load estimator.
#[derive(Debug, Clone, Default)]
pub struct DepthProbe(Arc<AtomicUsize>);

impl DepthProbe {
    pub fn depth(&self) -> usize {
        self.0.load(AtomicOrdering::Relaxed)
    }

    fn set(&self, depth: usize) {
        self.0.store(depth, AtomicOrdering::Relaxed);
    }
}

#[derive(Debug)]
pub struct TaskQueue {
    ready: BinaryHeap<Entry>,
    /// Tasks waiting for their `scheduled_at`.
    delayed: Vec<Entry>,
    max_size: usize,
    next_seq: u64,
    probe: DepthProbe,
}

impl TaskQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            ready: BinaryHeap::new(),
            delayed: Vec::new(),
            max_size: max_size.max(1),
            next_seq: 0,
            probe: DepthProbe::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn probe(&self) -> DepthProbe {
        self.probe.clone()
    }

    pub fn push(&mut self, task: TaskPayload) -> Result<()> {
        if self.len() >= self.max_size {
            warn!(task_id = %task.id, max_size = self.max_size, "task queue overflow; rejecting task");
            counter!("ingest_queue_overflow").increment(1);
            return Err(IngestError::QueueOverflow {
                max_size: self.max_size,
            });
        }

        let entry = Entry {
            task,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        if entry.task.scheduled_at.is_some() {
            self.delayed.push(entry);
        } else {
            self.ready.push(entry);
        }
        self.update_depth();
        Ok(())
    }

    /// Pop the best task that is due at `now`.
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<TaskPayload> {
        self.promote_due(now);
        let task = self.ready.pop().map(|e| e.task);
        self.update_depth();
        task
    }

    /// Pop every due task, best first.
    pub fn drain_ready(&mut self, now: DateTime<Utc>) -> Vec<TaskPayload> {
        self.promote_due(now);
        let mut out = Vec::with_capacity(self.ready.len());
        while let Some(entry) = self.ready.pop() {
            out.push(entry.task);
        }
        self.update_depth();
        out
    }

    /// Earliest `scheduled_at` among delayed tasks.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.delayed.iter().filter_map(|e| e.task.scheduled_at).min()
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let (due, waiting): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|e| e.task.is_due(now));
        self.delayed = waiting;
        self.ready.extend(due);
    }

    fn update_depth(&self) {
        let depth = self.len();
        self.probe.set(depth);
        gauge!("ingest_queue_depth").set(depth as f64);
    }
}
