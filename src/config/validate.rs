// src/config/validate.rs

use globset::Glob;
use regex::Regex;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{IngestError, Result};
use crate::types::TaskType;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = IngestError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

/// Run every validation rule against a raw config.
pub fn validate_config(cfg: &RawConfigFile) -> Result<()> {
    validate_raw_config(cfg)
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_pool(cfg)?;
    validate_scaling(cfg)?;
    validate_batching(cfg)?;
    validate_retry(cfg)?;
    validate_queue(cfg)?;
    validate_watch(cfg)?;
    Ok(())
}

fn config_error(msg: impl Into<String>) -> IngestError {
    IngestError::ConfigError(msg.into())
}

fn validate_pool(cfg: &RawConfigFile) -> Result<()> {
    let pool = &cfg.pool;

    if pool.min_workers == 0 {
        return Err(config_error("[pool].min_workers must be >= 1 (got 0)"));
    }
    if pool.min_workers > pool.max_workers {
        return Err(config_error(format!(
            "[pool].min_workers ({}) must not exceed max_workers ({})",
            pool.min_workers, pool.max_workers
        )));
    }
    if pool.worker_timeout.is_zero() {
        return Err(config_error("[pool].worker_timeout must be greater than zero"));
    }
    if pool.health_check_interval.is_zero() || pool.scale_check_interval.is_zero() {
        return Err(config_error(
            "[pool].health_check_interval and scale_check_interval must be greater than zero",
        ));
    }
    if pool.restart_threshold == 0 {
        return Err(config_error("[pool].restart_threshold must be >= 1 (got 0)"));
    }

    Ok(())
}

fn validate_scaling(cfg: &RawConfigFile) -> Result<()> {
    let rules = &cfg.pool.scaling;

    if !(rules.scale_up_threshold.is_finite() && rules.scale_down_threshold.is_finite()) {
        return Err(config_error("[pool.scaling] thresholds must be finite numbers"));
    }
    if rules.scale_down_threshold >= rules.scale_up_threshold {
        return Err(config_error(format!(
            "[pool.scaling].scale_down_threshold ({}) must be below scale_up_threshold ({})",
            rules.scale_down_threshold, rules.scale_up_threshold
        )));
    }

    Ok(())
}

fn validate_batching(cfg: &RawConfigFile) -> Result<()> {
    let batching = &cfg.batching;

    for task_type in TaskType::ALL {
        if batching.batch_size_for(task_type) == 0 {
            return Err(config_error(format!(
                "[batching] batch size for {} must be >= 1 (got 0)",
                task_type
            )));
        }
    }
    if batching.timeout_ms == 0 {
        return Err(config_error("[batching].timeout_ms must be >= 1 (got 0)"));
    }
    if batching.max_concurrent_batches == 0 {
        return Err(config_error(
            "[batching].max_concurrent_batches must be >= 1 (got 0)",
        ));
    }

    Ok(())
}

fn validate_retry(cfg: &RawConfigFile) -> Result<()> {
    let retry = &cfg.retry;

    if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
        return Err(config_error(format!(
            "[retry].backoff_multiplier must be >= 1.0 (got {})",
            retry.backoff_multiplier
        )));
    }
    if retry.max_backoff < retry.retry_delay {
        return Err(config_error(
            "[retry].max_backoff must not be shorter than retry_delay",
        ));
    }

    Ok(())
}

fn validate_queue(cfg: &RawConfigFile) -> Result<()> {
    if cfg.queue.max_size == 0 {
        return Err(config_error("[queue].max_size must be >= 1 (got 0)"));
    }
    Ok(())
}

fn validate_watch(cfg: &RawConfigFile) -> Result<()> {
    let watch = &cfg.watch;

    for pat in watch.include.iter().chain(watch.exclude.iter()) {
        Glob::new(pat)
            .map_err(|e| config_error(format!("[watch] invalid glob pattern '{pat}': {e}")))?;
    }

    if let Some(pattern) = &watch.module_pattern {
        Regex::new(pattern).map_err(|e| {
            config_error(format!("[watch].module_pattern is not a valid regex: {e}"))
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_from_str;

    fn expect_config_error(toml: &str, needle: &str) {
        let raw = load_from_str(toml).unwrap();
        match ConfigFile::try_from(raw) {
            Err(IngestError::ConfigError(msg)) => {
                assert!(msg.contains(needle), "unexpected message: {msg}")
            }
            other => panic!("expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(ConfigFile::try_from(RawConfigFile::default()).is_ok());
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        expect_config_error("[pool]\nmin_workers = 5\nmax_workers = 2\n", "must not exceed");
    }

    #[test]
    fn rejects_zero_batch_size() {
        expect_config_error("[batching]\nembedding_batch_size = 0\n", "embedding");
    }

    #[test]
    fn rejects_overlapping_scaling_thresholds() {
        expect_config_error(
            "[pool.scaling]\nscale_up_threshold = 2.0\nscale_down_threshold = 2.0\n",
            "scale_down_threshold",
        );
    }

    #[test]
    fn rejects_shrinking_backoff() {
        expect_config_error("[retry]\nbackoff_multiplier = 0.5\n", "backoff_multiplier");
    }

    #[test]
    fn rejects_bad_module_regex() {
        expect_config_error("[watch]\nmodule_pattern = \"(unclosed\"\n", "module_pattern");
    }
}
