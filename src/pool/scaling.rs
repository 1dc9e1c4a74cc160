// src/pool/scaling.rs

//! Auto-scaling.
//!
//! The decision itself is the pure function [`decide_scaling`]; the pool
//! only gathers its inputs and applies the result. Backlog is measured
//! through a [`LoadEstimator`], of which there are two:
//!
//! - [`IdleRatioEstimator`]: an approximation derived from how many workers
//!   are busy. It needs no queue integration but cannot see tasks that have
//!   not reached the pool yet.
//! - [`QueueDepthEstimator`]: the real depth of an upstream queue plus the
//!   callers waiting for a worker.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::gauge;
use tracing::{debug, info};

use crate::config::ScalingRules;
use crate::errors::{IngestError, Result};
use crate::events::PipelineEvent;
use crate::pool::WorkerPool;
use crate::queue::DepthProbe;
use crate::worker::WorkerStatus;

/// Most workers added in one scaling tick.
pub const MAX_SCALE_UP_STEP: usize = 2;

/// Scale-down requires strictly more idle workers than this.
pub const MIN_IDLE_FOR_SCALE_DOWN: usize = 2;

/// Pool occupancy as seen by a load estimator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSnapshot {
    pub active: usize,
    pub idle: usize,
    pub busy: usize,
    /// Callers blocked in `WorkerPool::submit`.
    pub waiting: usize,
}

/// Estimates backlog in the unit of `scale_up_threshold` /
/// `scale_down_threshold`.
pub trait LoadEstimator: Send + Sync + fmt::Debug {
    fn estimate_load(&self, snapshot: &LoadSnapshot) -> f64;
}

/// `busy / active * 10`: a fully busy pool reads 10, an idle one 0.
///
/// This is a heuristic, not a queue length: with the default thresholds
/// (5 / 1) the pool grows once more than half its workers are busy and
/// shrinks once fewer than a tenth are.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleRatioEstimator;

impl IdleRatioEstimator {
    pub const SCALE: f64 = 10.0;
}

impl LoadEstimator for IdleRatioEstimator {
    fn estimate_load(&self, snapshot: &LoadSnapshot) -> f64 {
        if snapshot.active == 0 {
            return if snapshot.waiting > 0 { Self::SCALE } else { 0.0 };
        }
        snapshot.busy as f64 / snapshot.active as f64 * Self::SCALE
    }
}

/// Upstream queue depth plus callers waiting for a worker.
#[derive(Clone)]
pub struct QueueDepthEstimator {
    depth: Arc<dyn Fn() -> usize + Send + Sync>,
}

impl fmt::Debug for QueueDepthEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDepthEstimator")
            .field("depth", &(self.depth)())
            .finish()
    }
}

impl QueueDepthEstimator {
    pub fn new<F>(depth: F) -> Self
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        Self {
            depth: Arc::new(depth),
        }
    }

    pub fn from_probe(probe: DepthProbe) -> Self {
        Self::new(move || probe.depth())
    }
}

impl LoadEstimator for QueueDepthEstimator {
    fn estimate_load(&self, snapshot: &LoadSnapshot) -> f64 {
        ((self.depth)() + snapshot.waiting) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Hold,
    ScaleUp(usize),
    ScaleDown(usize),
}

/// Everything [`decide_scaling`] looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingInput {
    pub load: f64,
    pub active: usize,
    pub idle: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Time since the last scale-up, `None` if there was none.
    pub since_scale_up: Option<Duration>,
    /// Time since the last scaling action in either direction.
    pub since_last_scaling: Option<Duration>,
}

/// Pure scaling policy.
///
/// - Up by at most [`MAX_SCALE_UP_STEP`] when load exceeds
///   `scale_up_threshold`, the pool is below `max_workers` and the
///   up-cooldown has elapsed since the last scale-up.
/// - Down when load is below `scale_down_threshold`, the pool is above
///   `min_workers`, more than [`MIN_IDLE_FOR_SCALE_DOWN`] workers are idle and
///   the down-cooldown has elapsed since the last scaling action of either
///   direction. Only idle workers are removed, never below `min_workers`.
pub fn decide_scaling(input: &ScalingInput, rules: &ScalingRules) -> ScalingDecision {
    let cooled = |since: Option<Duration>, cooldown: Duration| since.is_none_or(|d| d >= cooldown);

    if input.load > rules.scale_up_threshold
        && input.active < input.max_workers
        && cooled(input.since_scale_up, rules.scale_up_cooldown)
    {
        let step = (input.max_workers - input.active).min(MAX_SCALE_UP_STEP);
        return ScalingDecision::ScaleUp(step);
    }

    if input.load < rules.scale_down_threshold
        && input.active > input.min_workers
        && input.idle > MIN_IDLE_FOR_SCALE_DOWN
        && cooled(input.since_last_scaling, rules.scale_down_cooldown)
    {
        let step = (input.active - input.min_workers).min(input.idle);
        return ScalingDecision::ScaleDown(step);
    }

    ScalingDecision::Hold
}

impl WorkerPool {
    pub(crate) fn load_snapshot(&self) -> LoadSnapshot {
        let state = self.state();
        LoadSnapshot {
            active: state.workers.len(),
            idle: state.count(WorkerStatus::Idle),
            busy: state.count(WorkerStatus::Busy),
            waiting: self.shared.waiting.load(Ordering::Relaxed),
        }
    }

    pub fn estimate_load(&self) -> f64 {
        self.shared.estimator.estimate_load(&self.load_snapshot())
    }

    /// Run one auto-scaling tick. The scaling loop calls this every
    /// `scale_check_interval`; afterwards a `MetricsUpdated` event carries
    /// the resulting snapshot.
    pub async fn evaluate_scaling(&self) -> ScalingDecision {
        let snapshot = self.load_snapshot();
        let load = self.shared.estimator.estimate_load(&snapshot);
        let config = &self.shared.config;

        let input = {
            let state = self.state();
            if !state.running {
                return ScalingDecision::Hold;
            }
            let last_any = match (state.last_scale_up, state.last_scale_down) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            ScalingInput {
                load,
                active: state.workers.len(),
                idle: state.count(WorkerStatus::Idle),
                min_workers: config.min_workers,
                max_workers: config.max_workers,
                since_scale_up: state.last_scale_up.map(|t| t.elapsed()),
                since_last_scaling: last_any.map(|t| t.elapsed()),
            }
        };

        let decision = decide_scaling(&input, &config.scaling);
        gauge!("ingest_estimated_load").set(load);

        match decision {
            ScalingDecision::ScaleUp(n) => {
                info!(load, workers = input.active, adding = n, "scaling up");
                self.state().last_scale_up = Some(Instant::now());
                let _ = self.add_workers(n, None).await;
            }
            ScalingDecision::ScaleDown(n) => {
                info!(load, workers = input.active, removing = n, "scaling down");
                self.state().last_scale_down = Some(Instant::now());
                self.remove_idle_workers(n).await;
            }
            ScalingDecision::Hold => {
                debug!(load, workers = input.active, "scaling: hold");
            }
        }

        self.shared.bus.publish(PipelineEvent::MetricsUpdated(self.metrics()));
        decision
    }

    /// Move the pool to `target` workers, clamped to
    /// `[min_workers, max_workers]`. Scale-down only removes idle workers, so
    /// the result may stay above `target`. Returns the resulting count.
    pub async fn scale_workers(&self, target: usize) -> Result<usize> {
        if !self.is_running() {
            return Err(IngestError::PoolNotRunning);
        }
        let config = &self.shared.config;
        let target = target.clamp(config.min_workers, config.max_workers);
        let current = self.worker_count();

        if target > current {
            self.add_workers(target - current, None).await?;
        } else if target < current {
            self.remove_idle_workers(current - target).await;
        }

        Ok(self.worker_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ScalingRules {
        ScalingRules {
            scale_up_threshold: 5.0,
            scale_down_threshold: 1.0,
            scale_up_cooldown: Duration::from_secs(10),
            scale_down_cooldown: Duration::from_secs(30),
        }
    }

    fn input(load: f64, active: usize, idle: usize) -> ScalingInput {
        ScalingInput {
            load,
            active,
            idle,
            min_workers: 1,
            max_workers: 4,
            since_scale_up: None,
            since_last_scaling: None,
        }
    }

    #[test]
    fn scales_up_by_at_most_two_and_never_past_max() {
        assert_eq!(decide_scaling(&input(8.0, 1, 0), &rules()), ScalingDecision::ScaleUp(2));
        assert_eq!(decide_scaling(&input(8.0, 3, 0), &rules()), ScalingDecision::ScaleUp(1));
        assert_eq!(decide_scaling(&input(8.0, 4, 0), &rules()), ScalingDecision::Hold);
    }

    #[test]
    fn scale_up_respects_cooldown() {
        let mut i = input(8.0, 1, 0);
        i.since_scale_up = Some(Duration::from_secs(3));
        assert_eq!(decide_scaling(&i, &rules()), ScalingDecision::Hold);
        i.since_scale_up = Some(Duration::from_secs(10));
        assert_eq!(decide_scaling(&i, &rules()), ScalingDecision::ScaleUp(2));
    }

    #[test]
    fn scale_down_needs_more_than_two_idle_workers() {
        assert_eq!(decide_scaling(&input(0.0, 3, 2), &rules()), ScalingDecision::Hold);
        assert_eq!(decide_scaling(&input(0.0, 4, 3), &rules()), ScalingDecision::ScaleDown(3));

        let mut i = input(0.0, 4, 3);
        i.since_last_scaling = Some(Duration::from_secs(5));
        assert_eq!(decide_scaling(&i, &rules()), ScalingDecision::Hold);
    }

    #[test]
    fn idle_ratio_estimator_is_scaled_busy_share() {
        let e = IdleRatioEstimator;
        let snap = LoadSnapshot { active: 4, idle: 2, busy: 2, waiting: 0 };
        assert_eq!(e.estimate_load(&snap), 5.0);
        assert_eq!(e.estimate_load(&LoadSnapshot::default()), 0.0);
    }

    #[test]
    fn queue_depth_estimator_adds_waiting_callers() {
        let e = QueueDepthEstimator::new(|| 7);
        let snap = LoadSnapshot { waiting: 2, ..LoadSnapshot::default() };
        assert_eq!(e.estimate_load(&snap), 9.0);
    }
}
