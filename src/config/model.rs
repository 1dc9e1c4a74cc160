// src/config/model.rs

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{ExecutionMode, FailurePolicy, LoadEstimatorKind, TaskType};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [pool]
/// min_workers = 2
/// max_workers = 8
/// worker_timeout = "30s"
///
/// [pool.scaling]
/// scale_up_threshold = 5.0
///
/// [batching]
/// entity_batch_size = 50
/// timeout_ms = 1000
/// ```
///
/// All sections are optional and have reasonable defaults. This is the raw,
/// unvalidated form; use [`ConfigFile`] everywhere else.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub batching: BatchingConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub watch: WatchConfig,
}

/// Validated configuration. Only obtainable through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigFile {
    pub pool: PoolConfig,
    pub batching: BatchingConfig,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
    pub watch: WatchConfig,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            pool: raw.pool,
            batching: raw.batching,
            retry: raw.retry,
            queue: raw.queue,
            watch: raw.watch,
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::new_unchecked(RawConfigFile::default())
    }
}

/// `[pool]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Hard limit for a single task execution.
    #[serde(with = "crate::config::duration")]
    pub worker_timeout: Duration,
    #[serde(with = "crate::config::duration")]
    pub health_check_interval: Duration,
    /// Consecutive task errors after which a worker is restarted.
    pub restart_threshold: u32,
    pub auto_scale: bool,
    #[serde(with = "crate::config::duration")]
    pub scale_check_interval: Duration,
    pub execution: ExecutionMode,
    pub load_estimator: LoadEstimatorKind,
    /// Bounded wait for a worker to acknowledge shutdown before it is
    /// abandoned.
    #[serde(with = "crate::config::duration")]
    pub shutdown_grace: Duration,
    pub scaling: ScalingRules,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            worker_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
            restart_threshold: 3,
            auto_scale: true,
            scale_check_interval: Duration::from_secs(1),
            execution: ExecutionMode::InProcess,
            load_estimator: LoadEstimatorKind::IdleRatio,
            shutdown_grace: Duration::from_secs(2),
            scaling: ScalingRules::default(),
        }
    }
}

/// `[pool.scaling]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScalingRules {
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    #[serde(with = "crate::config::duration")]
    pub scale_up_cooldown: Duration,
    #[serde(with = "crate::config::duration")]
    pub scale_down_cooldown: Duration,
}

impl Default for ScalingRules {
    fn default() -> Self {
        Self {
            scale_up_threshold: 5.0,
            scale_down_threshold: 1.0,
            scale_up_cooldown: Duration::from_secs(10),
            scale_down_cooldown: Duration::from_secs(30),
        }
    }
}

/// `[batching]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub entity_batch_size: usize,
    pub relationship_batch_size: usize,
    pub embedding_batch_size: usize,
    pub parse_batch_size: usize,
    /// Maximum time a partially filled group waits before it is flushed.
    pub timeout_ms: u64,
    pub max_concurrent_batches: usize,
}

impl BatchingConfig {
    pub fn batch_size_for(&self, task_type: TaskType) -> usize {
        match task_type {
            TaskType::Parse => self.parse_batch_size,
            TaskType::EntityUpsert => self.entity_batch_size,
            TaskType::RelationshipUpsert => self.relationship_batch_size,
            TaskType::Embedding => self.embedding_batch_size,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            entity_batch_size: 50,
            relationship_batch_size: 100,
            embedding_batch_size: 16,
            parse_batch_size: 10,
            timeout_ms: 1000,
            max_concurrent_batches: 4,
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "crate::config::duration")]
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "crate::config::duration")]
    pub max_backoff: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
            failure_policy: FailurePolicy::Isolate,
        }
    }
}

/// `[queue]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_size: 10_000 }
    }
}

/// `[watch]` section.
///
/// ```toml
/// [watch]
/// root = "."
/// include = ["src/**/*.rs"]
/// exclude = ["target/**"]
/// module_pattern = "^(?P<namespace>[^/]+)/(?P<module>[^/]+)/"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    pub root: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Regex with optional `namespace` / `module` named captures, applied to
    /// the path relative to `root`.
    pub module_pattern: Option<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: ".".to_string(),
            include: vec!["**/*".to_string()],
            exclude: Vec::new(),
            module_pattern: None,
        }
    }
}
