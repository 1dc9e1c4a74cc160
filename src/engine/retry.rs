// src/engine/retry.rs

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RetryConfig;
use crate::errors::WorkerError;
use crate::types::TaskPayload;

/// Exponential backoff for failed tasks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            retry_delay: cfg.retry_delay,
            backoff_multiplier: cfg.backoff_multiplier,
            max_backoff: cfg.max_backoff,
        }
    }
}

impl RetryPolicy {
    /// `retry_delay * multiplier^attempt`, capped at `max_backoff`.
    /// `attempt` is the number of retries already made.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.retry_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Only retryable errors are retried, and only while the task has
    /// attempts left.
    pub fn should_retry(&self, task: &TaskPayload, error: &WorkerError) -> bool {
        error.retryable && task.retry_count < task.max_retries
    }

    /// The task to resubmit after a failed attempt.
    pub fn next_attempt(&self, task: &TaskPayload, now: DateTime<Utc>) -> TaskPayload {
        let delay = self.delay_for(task.retry_count);
        let mut next = task.clone();
        next.retry_count += 1;
        next.scheduled_at = Some(
            chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(now),
        );
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;
    use serde_json::Value;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(500),
        }
    }

    #[test]
    fn delay_grows_exponentially_up_to_cap() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
        assert_eq!(p.delay_for(3), Duration::from_millis(500));
        assert_eq!(p.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn only_retryable_errors_with_attempts_left_are_retried() {
        let p = policy();
        let task = TaskPayload::new("t", TaskType::EntityUpsert, Value::Null).with_max_retries(1);
        let err = WorkerError::task_failed("boom");

        assert!(p.should_retry(&task, &err));
        assert!(!p.should_retry(&task, &err.clone().non_retryable()));

        let retried = p.next_attempt(&task, Utc::now());
        assert_eq!(retried.retry_count, 1);
        assert!(retried.scheduled_at.is_some());
        assert!(!p.should_retry(&retried, &err));
    }
}
