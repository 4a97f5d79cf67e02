//! Backpressure controller for the acquisition cycle.
//!
//! Additive-increase/multiplicative-decrease on the poll batch size, mirrored
//! on the poll interval: sustained rejections halve the batch and double the
//! interval, a quiet pool below the low-water mark grows the batch back one
//! step per cycle and snaps the interval back to its base.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Controller tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Batch size the controller never shrinks below
    pub min_batch_size: usize,
    /// Rejections inside `window` that count as sustained pressure
    pub rejection_threshold: usize,
    pub window: Duration,
    /// Utilization (0.0-1.0) under which defaults are restored
    pub low_water_mark: f64,
    /// Batch growth per quiet cycle
    pub increase_step: usize,
    /// Upper bound for the stretched poll interval
    pub max_interval: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 1,
            rejection_threshold: 1,
            window: Duration::from_secs(10),
            low_water_mark: 0.5,
            increase_step: 1,
            max_interval: Duration::from_secs(5),
        }
    }
}

/// One observation fed to the controller after an acquisition cycle.
#[derive(Debug, Clone, Copy)]
pub struct PressureSample {
    /// Busy workers / pool size
    pub utilization: f64,
    /// Submissions the pool rejected in this cycle
    pub rejected: usize,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct BackpressureController {
    config: BackpressureConfig,
    default_batch_size: usize,
    base_interval: Duration,
    batch_size: usize,
    interval: Duration,
    rejections: VecDeque<(Instant, usize)>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig, default_batch_size: usize, base_interval: Duration) -> Self {
        let default_batch_size = default_batch_size.max(config.min_batch_size).max(1);
        Self {
            config,
            default_batch_size,
            base_interval,
            batch_size: default_batch_size,
            interval: base_interval,
            rejections: VecDeque::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn poll_interval(&self) -> Duration {
        self.interval
    }

    /// Rejections counted inside the current window.
    pub fn recent_rejections(&self) -> usize {
        self.rejections.iter().map(|(_, n)| n).sum()
    }

    pub fn is_throttled(&self) -> bool {
        self.batch_size < self.default_batch_size || self.interval > self.base_interval
    }

    pub fn observe(&mut self, sample: PressureSample) {
        while let Some((at, _)) = self.rejections.front() {
            if sample.at.saturating_duration_since(*at) > self.config.window {
                self.rejections.pop_front();
            } else {
                break;
            }
        }
        if sample.rejected > 0 {
            self.rejections.push_back((sample.at, sample.rejected));
        }

        if sample.rejected > 0 && self.recent_rejections() >= self.config.rejection_threshold {
            self.batch_size = (self.batch_size / 2).max(self.config.min_batch_size).max(1);
            self.interval = self
                .interval
                .max(Duration::from_millis(1))
                .saturating_mul(2)
                .min(self.config.max_interval.max(self.base_interval));
            debug!(
                batch_size = self.batch_size,
                interval_ms = self.interval.as_millis() as u64,
                rejected = sample.rejected,
                "backpressure: throttling acquisition"
            );
        } else if sample.utilization < self.config.low_water_mark && self.recent_rejections() == 0 {
            if self.is_throttled() {
                debug!(batch_size = self.batch_size, "backpressure: pool drained, restoring");
            }
            self.batch_size = (self.batch_size + self.config.increase_step).min(self.default_batch_size);
            self.interval = self.base_interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(utilization: f64, rejected: usize, at: Instant) -> PressureSample {
        PressureSample {
            utilization,
            rejected,
            at,
        }
    }

    fn controller() -> BackpressureController {
        BackpressureController::new(BackpressureConfig::default(), 16, Duration::from_millis(100))
    }

    #[test]
    fn rejections_shrink_batch_and_stretch_interval() {
        let mut bp = controller();
        let t0 = Instant::now();

        bp.observe(sample(1.0, 4, t0));
        assert_eq!(bp.batch_size(), 8);
        assert_eq!(bp.poll_interval(), Duration::from_millis(200));

        bp.observe(sample(1.0, 2, t0));
        bp.observe(sample(1.0, 2, t0));
        bp.observe(sample(1.0, 2, t0));
        bp.observe(sample(1.0, 2, t0));
        bp.observe(sample(1.0, 2, t0));
        assert_eq!(bp.batch_size(), 1);
        assert_eq!(bp.poll_interval(), Duration::from_secs(5));
        assert!(bp.is_throttled());
    }

    #[test]
    fn busy_pool_without_rejections_holds_steady() {
        let mut bp = controller();
        let t0 = Instant::now();
        bp.observe(sample(1.0, 4, t0));

        bp.observe(sample(0.9, 0, t0 + Duration::from_secs(30)));
        assert_eq!(bp.batch_size(), 8);
        assert_eq!(bp.poll_interval(), Duration::from_millis(200));
    }

    #[test]
    fn recovery_waits_for_window_to_clear() {
        let mut bp = controller();
        let t0 = Instant::now();
        bp.observe(sample(1.0, 4, t0));

        // Still inside the rejection window.
        bp.observe(sample(0.1, 0, t0 + Duration::from_secs(1)));
        assert_eq!(bp.batch_size(), 8);

        bp.observe(sample(0.1, 0, t0 + Duration::from_secs(11)));
        assert_eq!(bp.recent_rejections(), 0);
        assert_eq!(bp.batch_size(), 9);
        assert_eq!(bp.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn additive_increase_caps_at_default() {
        let mut bp = controller();
        let t0 = Instant::now();
        bp.observe(sample(1.0, 1, t0));
        assert_eq!(bp.batch_size(), 8);

        for i in 0..20 {
            bp.observe(sample(0.0, 0, t0 + Duration::from_secs(11 + i)));
        }
        assert_eq!(bp.batch_size(), 16);
        assert!(!bp.is_throttled());
    }
}
