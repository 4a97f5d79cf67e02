//! Engine configuration.
//!
//! Defaults are usable as-is; `from_env` overlays `JOBFORGE_*` variables:
//!
//! | Variable                          | Field                 |
//! |-----------------------------------|-----------------------|
//! | `JOBFORGE_ENGINE_NAME`            | `engine_name`         |
//! | `JOBFORGE_BATCH_SIZE`             | `batch_size`          |
//! | `JOBFORGE_LOCK_DURATION_MS`       | `lock_duration`       |
//! | `JOBFORGE_MAX_POOL_SIZE`          | `max_pool_size`       |
//! | `JOBFORGE_QUEUE_CAPACITY`         | `queue_capacity`      |
//! | `JOBFORGE_DEFAULT_RETRIES`        | `default_retries`     |
//! | `JOBFORGE_BACKOFF`                | `retry_policy.strategy` (`fixed`, `exponential`, `linear`) |
//! | `JOBFORGE_RETRY_DELAY_MS`         | `retry_policy.base_delay` |
//! | `JOBFORGE_MAX_RETRY_DELAY_MS`     | `retry_policy.max_delay` |
//! | `JOBFORGE_TRANSACTION_TIMEOUT_MS` | `transaction_timeout` |
//! | `JOBFORGE_POLL_INTERVAL_MS`       | `poll_interval`       |
//! | `JOBFORGE_MAX_IDLE_WAIT_MS`       | `max_idle_wait`       |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::backpressure::BackpressureConfig;
use crate::jobs::retry::{BackoffStrategy, RetryPolicy};
use crate::jobs::types::DEFAULT_RETRIES;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prefix of the lock owner id and of thread names
    pub engine_name: String,
    /// Jobs polled per acquisition cycle
    pub batch_size: usize,
    /// Lock lifetime; must exceed the worst-case handler run time
    pub lock_duration: Duration,
    /// Execution pool workers
    pub max_pool_size: usize,
    /// Jobs that may wait for a free worker
    pub queue_capacity: usize,
    pub default_retries: u32,
    pub retry_policy: RetryPolicy,
    /// Upper bound for a single command execution
    pub transaction_timeout: Duration,
    /// Wait between polls while work keeps coming
    pub poll_interval: Duration,
    /// Cap for the idle backoff between empty polls
    pub max_idle_wait: Duration,
    /// Consecutive failed cycles before the engine reports unhealthy
    pub store_failure_threshold: u32,
    pub backpressure: BackpressureConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_name: "jobforge".to_string(),
            batch_size: 10,
            lock_duration: Duration::from_secs(300),
            max_pool_size: 4,
            queue_capacity: 4,
            default_retries: DEFAULT_RETRIES,
            retry_policy: RetryPolicy::default(),
            transaction_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            max_idle_wait: Duration::from_secs(5),
            store_failure_threshold: 3,
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.engine_name = name.into();
        self
    }

    pub fn with_pool(mut self, workers: usize, queue_capacity: usize) -> Self {
        self.max_pool_size = workers;
        self.queue_capacity = queue_capacity;
        self
    }

    /// Defaults overlaid with `JOBFORGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(name) = lookup("JOBFORGE_ENGINE_NAME") {
            cfg.engine_name = name;
        }
        if let Some(v) = parse(&lookup, "JOBFORGE_BATCH_SIZE")? {
            cfg.batch_size = v;
        }
        if let Some(ms) = parse(&lookup, "JOBFORGE_LOCK_DURATION_MS")? {
            cfg.lock_duration = Duration::from_millis(ms);
        }
        if let Some(v) = parse(&lookup, "JOBFORGE_MAX_POOL_SIZE")? {
            cfg.max_pool_size = v;
        }
        if let Some(v) = parse(&lookup, "JOBFORGE_QUEUE_CAPACITY")? {
            cfg.queue_capacity = v;
        }
        if let Some(v) = parse(&lookup, "JOBFORGE_DEFAULT_RETRIES")? {
            cfg.default_retries = v;
        }
        if let Some(raw) = lookup("JOBFORGE_BACKOFF") {
            let strategy = match raw.trim().to_ascii_lowercase().as_str() {
                "fixed" => BackoffStrategy::Fixed,
                "exponential" => BackoffStrategy::Exponential,
                "linear" => BackoffStrategy::Linear,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "JOBFORGE_BACKOFF".to_string(),
                        value: raw,
                    });
                }
            };
            cfg.retry_policy.strategy = strategy;
        }
        if let Some(ms) = parse(&lookup, "JOBFORGE_RETRY_DELAY_MS")? {
            cfg.retry_policy.base_delay = Duration::from_millis(ms);
            cfg.retry_policy.max_delay = cfg.retry_policy.max_delay.max(cfg.retry_policy.base_delay);
        }
        if let Some(ms) = parse(&lookup, "JOBFORGE_MAX_RETRY_DELAY_MS")? {
            cfg.retry_policy.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "JOBFORGE_TRANSACTION_TIMEOUT_MS")? {
            cfg.transaction_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "JOBFORGE_POLL_INTERVAL_MS")? {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "JOBFORGE_MAX_IDLE_WAIT_MS")? {
            cfg.max_idle_wait = Duration::from_millis(ms);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine_name.trim().is_empty() {
            return Err(ConfigError::Invalid("engine_name must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.max_pool_size == 0 {
            return Err(ConfigError::Invalid("max_pool_size must be at least 1".into()));
        }
        // A lock that can expire while its transaction may still commit allows
        // two engines to run the same job.
        if self.lock_duration <= self.transaction_timeout {
            return Err(ConfigError::Invalid(format!(
                "lock_duration ({:?}) must exceed transaction_timeout ({:?})",
                self.lock_duration, self.transaction_timeout
            )));
        }
        if self.retry_policy.max_delay < self.retry_policy.base_delay {
            return Err(ConfigError::Invalid("retry max_delay is below base_delay".into()));
        }
        if !(0.0..=1.0).contains(&self.retry_policy.jitter) {
            return Err(ConfigError::Invalid("retry jitter must be within 0.0..=1.0".into()));
        }
        if self.max_idle_wait < self.poll_interval {
            return Err(ConfigError::Invalid("max_idle_wait is below poll_interval".into()));
        }
        if !(0.0..=1.0).contains(&self.backpressure.low_water_mark) {
            return Err(ConfigError::Invalid("backpressure low_water_mark must be within 0.0..=1.0".into()));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn environment_overrides_defaults() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("JOBFORGE_ENGINE_NAME", "node-7"),
            ("JOBFORGE_BATCH_SIZE", "25"),
            ("JOBFORGE_MAX_POOL_SIZE", "8"),
            ("JOBFORGE_DEFAULT_RETRIES", "5"),
            ("JOBFORGE_BACKOFF", "Exponential"),
            ("JOBFORGE_RETRY_DELAY_MS", "250"),
            ("JOBFORGE_MAX_RETRY_DELAY_MS", "60000"),
        ]))
        .unwrap();

        assert_eq!(cfg.engine_name, "node-7");
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.max_pool_size, 8);
        assert_eq!(cfg.default_retries, 5);
        assert_eq!(cfg.retry_policy.strategy, BackoffStrategy::Exponential);
        assert_eq!(cfg.retry_policy.base_delay, Duration::from_millis(250));
        assert_eq!(cfg.retry_policy.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn malformed_numbers_are_reported_with_their_key() {
        let err = EngineConfig::from_lookup(lookup(&[("JOBFORGE_BATCH_SIZE", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "JOBFORGE_BATCH_SIZE".into(),
                value: "lots".into()
            }
        );
    }

    #[test]
    fn lock_must_outlive_transactions() {
        let err = EngineConfig::from_lookup(lookup(&[("JOBFORGE_LOCK_DURATION_MS", "1000")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_pool_is_rejected() {
        let cfg = EngineConfig::default().with_pool(0, 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = EngineConfig::default().with_name("n1");
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
