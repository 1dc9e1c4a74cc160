// src/config/mod.rs

//! Configuration loading and validation for ingestflow.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Parse duration strings (`duration.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate pool, batching, retry and watch settings (`validate.rs`).

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, load_from_str, load_or_default};
pub use model::{
    BatchingConfig, ConfigFile, PoolConfig, QueueConfig, RawConfigFile, RetryConfig,
    ScalingRules, WatchConfig,
};
pub use validate::validate_config;
