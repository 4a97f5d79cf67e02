//! Failure/retry policy: decrement, back off, or escalate to an incident.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use jobforge_core::{JobId, LockOwner};

use crate::command_executor::{Command, CommandContext, CommandError};

use super::handler::{HandlerError, JobHandler};
use super::types::{Incident, Job};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Computes the delay before the next attempt of a failed job.
pub trait RetryBackoff: Send + Sync {
    /// `attempt` is the number of failures so far (1 after the first failure).
    fn delay_for_attempt(&self, attempt: u32) -> Duration;
}

/// Retry delay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to spread retries of jobs failing together
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(10))
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

impl RetryBackoff for RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = (self.max_delay.as_millis() as f64).max(base_ms);

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// What happens to a job after a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    Retry {
        retries_remaining: u32,
        due_date: DateTime<Utc>,
    },
    Incident,
}

/// Decides retries and backoff for failed jobs.
#[derive(Clone)]
pub struct FailurePolicy {
    backoff: Arc<dyn RetryBackoff>,
}

impl FailurePolicy {
    pub fn new(backoff: Arc<dyn RetryBackoff>) -> Self {
        Self { backoff }
    }

    /// `job` must already carry the failure being decided on
    /// (`failed_attempts` incremented).
    pub fn decide(
        &self,
        job: &Job,
        handler: Option<&dyn JobHandler>,
        error: &HandlerError,
        now: DateTime<Utc>,
    ) -> FailureDecision {
        let default_next = job.retries_remaining.saturating_sub(1);
        let retries_remaining = handler
            .map(|h| h.retries_after_failure(job))
            .unwrap_or(default_next)
            .min(default_next);

        if retries_remaining == 0 {
            return FailureDecision::Incident;
        }

        let delay = handler
            .and_then(|h| h.retry_delay(job, error))
            .unwrap_or_else(|| self.backoff.delay_for_attempt(job.failed_attempts));

        FailureDecision::Retry {
            retries_remaining,
            due_date: chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::new(Arc::new(RetryPolicy::default()))
    }
}

impl std::fmt::Debug for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailurePolicy").finish_non_exhaustive()
    }
}

/// Result of the retry bookkeeping transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled {
        retries_remaining: u32,
        due_date: DateTime<Utc>,
    },
    IncidentCreated,
    /// Job was cancelled while executing; nothing to record.
    Vanished,
}

/// Retry bookkeeping for one failed execution.
///
/// Runs as its own transaction after the handler's transaction rolled back.
pub struct RecordFailure<'p> {
    pub job_id: JobId,
    pub owner: LockOwner,
    pub error: HandlerError,
    pub handler: Option<Arc<dyn JobHandler>>,
    pub policy: &'p FailurePolicy,
}

impl Command for RecordFailure<'_> {
    type Output = FailureOutcome;

    fn name(&self) -> &str {
        "record-job-failure"
    }

    fn execute(self, ctx: &mut CommandContext<'_>) -> Result<FailureOutcome, CommandError> {
        let Some(mut job) = ctx.find_job(&self.job_id)? else {
            debug!(job_id = %self.job_id, "failed job was deleted meanwhile");
            return Ok(FailureOutcome::Vanished);
        };
        if !job.is_locked_by(&self.owner) {
            return Err(CommandError::contention(format!(
                "job {} is no longer locked by {}",
                job.id, self.owner
            )));
        }

        let now = ctx.now();
        job.record_failure(self.error.message.clone(), self.error.details.clone());
        job.release_lock();

        match self.policy.decide(&job, self.handler.as_deref(), &self.error, now) {
            FailureDecision::Retry {
                retries_remaining,
                due_date,
            } => {
                debug!(
                    job_id = %job.id,
                    retries = retries_remaining,
                    due = %due_date,
                    error = %self.error,
                    "job failed, retry scheduled"
                );
                job.retries_remaining = retries_remaining;
                job.due_date = Some(due_date);
                ctx.update_job(job);
                Ok(FailureOutcome::Rescheduled {
                    retries_remaining,
                    due_date,
                })
            }
            FailureDecision::Incident => {
                warn!(job_id = %job.id, job_type = %job.job_type, error = %self.error, "job exhausted retries");
                job.retries_remaining = 0;
                let incident = Incident::for_job(&job, self.error.message.clone(), self.error.details.clone(), now);
                ctx.update_job(job);
                ctx.raise_incident(incident);
                Ok(FailureOutcome::IncidentCreated)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::handler::FnHandler;

    struct HalvingHandler;

    impl JobHandler for HalvingHandler {
        fn handle(&self, _job: &Job, _ctx: &mut CommandContext<'_>) -> Result<(), HandlerError> {
            Ok(())
        }

        fn retries_after_failure(&self, job: &Job) -> u32 {
            job.retries_remaining / 2
        }
    }

    struct GrowingHandler;

    impl JobHandler for GrowingHandler {
        fn handle(&self, _job: &Job, _ctx: &mut CommandContext<'_>) -> Result<(), HandlerError> {
            Ok(())
        }

        fn retries_after_failure(&self, job: &Job) -> u32 {
            job.retries_remaining + 10
        }

        fn retry_delay(&self, _job: &Job, _error: &HandlerError) -> Option<Duration> {
            Some(Duration::from_secs(1))
        }
    }

    fn failed(retries: u32, attempts: u32) -> Job {
        let mut job = Job::new("t").with_retries(retries);
        job.failed_attempts = attempts;
        job
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10)).with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy::linear(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::exponential(Duration::from_millis(1000), Duration::from_secs(60)).with_jitter(0.2);
        for attempt in 1..6 {
            let nominal = 1000.0 * 2_f64.powi(attempt as i32 - 1);
            let actual = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!((actual - nominal).abs() <= nominal * 0.2 + 1.0, "attempt {attempt}: {actual}");
        }
    }

    #[test]
    fn default_decrement_schedules_retry() {
        let policy = FailurePolicy::new(Arc::new(RetryPolicy::fixed(Duration::from_secs(5))));
        let now = Utc::now();

        let decision = policy.decide(&failed(3, 1), None, &HandlerError::new("boom"), now);

        assert_eq!(
            decision,
            FailureDecision::Retry {
                retries_remaining: 2,
                due_date: now + chrono::Duration::seconds(5),
            }
        );
    }

    #[test]
    fn last_retry_escalates() {
        let policy = FailurePolicy::default();
        let decision = policy.decide(&failed(1, 1), None, &HandlerError::new("boom"), Utc::now());
        assert_eq!(decision, FailureDecision::Incident);
    }

    #[test]
    fn handler_can_halve_retries() {
        let policy = FailurePolicy::default();
        let handler = HalvingHandler;

        let decision = policy.decide(&failed(8, 1), Some(&handler), &HandlerError::new("boom"), Utc::now());
        assert!(matches!(decision, FailureDecision::Retry { retries_remaining: 4, .. }));

        let decision = policy.decide(&failed(1, 1), Some(&handler), &HandlerError::new("boom"), Utc::now());
        assert_eq!(decision, FailureDecision::Incident);
    }

    #[test]
    fn handler_cannot_grow_retries_but_can_override_delay() {
        let policy = FailurePolicy::default();
        let now = Utc::now();

        let decision = policy.decide(&failed(3, 1), Some(&GrowingHandler), &HandlerError::new("boom"), now);

        assert_eq!(
            decision,
            FailureDecision::Retry {
                retries_remaining: 2,
                due_date: now + chrono::Duration::seconds(1),
            }
        );
    }

    #[test]
    fn plain_handlers_use_default_decrement() {
        let policy = FailurePolicy::default();
        let handler = FnHandler(|_: &Job, _: &mut CommandContext<'_>| -> Result<(), HandlerError> { Ok(()) });
        let decision = policy.decide(&failed(2, 1), Some(&handler), &HandlerError::new("boom"), Utc::now());
        assert!(matches!(decision, FailureDecision::Retry { retries_remaining: 1, .. }));
    }
}
