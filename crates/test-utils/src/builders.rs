#![allow(dead_code)]

use std::time::Duration;

use chrono::Utc;
use ingestflow::config::{ConfigFile, RawConfigFile};
use ingestflow::types::{
    ChangeEvent, ChangeEventType, ChangeFragment, EntityData, ExecutionMode, FailurePolicy,
    FragmentOperation, LoadEstimatorKind, RelationshipData, TaskPayload, TaskType,
};
use serde_json::Value;

/// Builder for `ConfigFile` to simplify test setup.
///
/// Starts from defaults tuned for tests: no auto-scaling, fast health and
/// scaling intervals, short batch timeout and no retry delay.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        let mut config = RawConfigFile::default();
        config.pool.auto_scale = false;
        config.pool.health_check_interval = Duration::from_secs(3600);
        config.pool.scale_check_interval = Duration::from_millis(20);
        config.pool.shutdown_grace = Duration::from_millis(200);
        config.batching.timeout_ms = 20;
        config.retry.retry_delay = Duration::from_millis(1);
        config.retry.max_backoff = Duration::from_millis(5);
        Self { config }
    }

    pub fn workers(mut self, min: usize, max: usize) -> Self {
        self.config.pool.min_workers = min;
        self.config.pool.max_workers = max;
        self
    }

    pub fn auto_scale(mut self, on: bool) -> Self {
        self.config.pool.auto_scale = on;
        self
    }

    pub fn worker_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.worker_timeout = timeout;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.pool.health_check_interval = interval;
        self
    }

    pub fn scale_check_interval(mut self, interval: Duration) -> Self {
        self.config.pool.scale_check_interval = interval;
        self
    }

    pub fn restart_threshold(mut self, n: u32) -> Self {
        self.config.pool.restart_threshold = n;
        self
    }

    pub fn execution(mut self, mode: ExecutionMode) -> Self {
        self.config.pool.execution = mode;
        self
    }

    pub fn load_estimator(mut self, kind: LoadEstimatorKind) -> Self {
        self.config.pool.load_estimator = kind;
        self
    }

    /// Scale-up threshold with no cooldowns.
    pub fn scale_up_above(mut self, threshold: f64) -> Self {
        let scaling = &mut self.config.pool.scaling;
        scaling.scale_up_threshold = threshold;
        scaling.scale_down_threshold = scaling.scale_down_threshold.min(threshold / 2.0);
        scaling.scale_up_cooldown = Duration::ZERO;
        scaling.scale_down_cooldown = Duration::ZERO;
        self
    }

    /// Same size for every task type.
    pub fn batch_size(mut self, size: usize) -> Self {
        let b = &mut self.config.batching;
        b.entity_batch_size = size;
        b.relationship_batch_size = size;
        b.embedding_batch_size = size;
        b.parse_batch_size = size;
        self
    }

    pub fn batch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.batching.timeout_ms = ms;
        self
    }

    pub fn max_concurrent_batches(mut self, n: usize) -> Self {
        self.config.batching.max_concurrent_batches = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.retry.max_retries = n;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.retry.failure_policy = policy;
        self
    }

    pub fn queue_max_size(mut self, n: usize) -> Self {
        self.config.queue.max_size = n;
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A task with `Null` data and default priority.
pub fn task(id: &str, task_type: TaskType) -> TaskPayload {
    TaskPayload::new(id, task_type, Value::Null)
}

pub fn change_event(id: &str, file_path: &str, event_type: ChangeEventType) -> ChangeEvent {
    let mut parts = file_path.split('/');
    let namespace = parts.next().unwrap_or("default").to_string();
    let module = parts.next().unwrap_or("root").to_string();
    ChangeEvent {
        id: id.to_string(),
        namespace,
        module,
        file_path: file_path.to_string(),
        event_type,
        timestamp: Utc::now(),
        size: 0,
        diff_hash: String::new(),
        metadata: Default::default(),
    }
}

pub fn entity(id: &str) -> EntityData {
    EntityData {
        id: id.to_string(),
        kind: "symbol".to_string(),
        name: id.to_string(),
        properties: Value::Null,
        embed: false,
    }
}

pub fn entity_fragment(id: &str, operation: FragmentOperation) -> ChangeFragment {
    ChangeFragment::entity(operation, entity(id))
}

pub fn relationship_fragment(
    id: &str,
    source: &str,
    target: &str,
    operation: FragmentOperation,
) -> ChangeFragment {
    ChangeFragment::relationship(
        operation,
        RelationshipData {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            kind: "references".to_string(),
            properties: Value::Null,
        },
    )
}
