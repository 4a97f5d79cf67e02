//! Core job types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobforge_core::{JobId, LockOwner, ScopeId};

/// Well-known job type discriminators.
///
/// The engine never interprets these; they only select a registered handler.
pub mod job_types {
    pub const TIMER_FIRE: &str = "timer-fire";
    pub const ASYNC_CONTINUATION: &str = "async-continuation";
    pub const BATCH_STEP: &str = "batch-step";
}

/// Retries a job gets when nothing else is configured.
pub const DEFAULT_RETRIES: u32 = 3;

/// A persisted unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Handler discriminator
    pub job_type: String,
    /// Opaque payload, interpreted only by the matching handler
    pub handler_configuration: Option<String>,
    /// Process/case instance the job belongs to
    pub scope_id: Option<ScopeId>,
    /// Serialize with other exclusive jobs of the same scope
    pub exclusive: bool,
    /// Not eligible for acquisition before this instant (`None` = immediately)
    pub due_date: Option<DateTime<Utc>>,
    /// Engine currently holding the job
    pub lock_owner: Option<LockOwner>,
    /// After this instant the lock is considered abandoned
    pub lock_expiration_time: Option<DateTime<Utc>>,
    /// 0 means an incident exists and the job is no longer acquired
    pub retries_remaining: u32,
    /// Retries each new run of a recurring job starts with
    pub configured_retries: u32,
    /// Number of failed executions so far (drives backoff)
    pub failed_attempts: u32,
    /// Higher runs first
    pub priority: i64,
    /// Suspended jobs are never acquired
    pub suspended: bool,
    /// Recurring jobs are replaced by a new run this far ahead
    pub repeat_interval: Option<Duration>,
    pub last_failure_message: Option<String>,
    pub last_failure_details: Option<String>,
    /// Optimistic-lock version, bumped by the store on every persisted mutation
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a new, immediately due job with default retries.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            handler_configuration: None,
            scope_id: None,
            exclusive: true,
            due_date: None,
            lock_owner: None,
            lock_expiration_time: None,
            retries_remaining: DEFAULT_RETRIES,
            configured_retries: DEFAULT_RETRIES,
            failed_attempts: 0,
            priority: 0,
            suspended: false,
            repeat_interval: None,
            last_failure_message: None,
            last_failure_details: None,
            revision: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.handler_configuration = Some(configuration.into());
        self
    }

    /// Attach the job to a scope. Exclusive jobs of one scope run one at a time.
    pub fn in_scope(mut self, scope: impl Into<ScopeId>, exclusive: bool) -> Self {
        self.scope_id = Some(scope.into());
        self.exclusive = exclusive;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn due_at(mut self, at: DateTime<Utc>) -> Self {
        self.due_date = Some(at);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_remaining = retries;
        self.configured_retries = retries;
        self
    }

    pub fn repeating(mut self, interval: Duration) -> Self {
        self.repeat_interval = Some(interval);
        self
    }

    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    /// Next run of a recurring job: same definition, new id, fresh retries.
    pub fn next_run(&self, due_date: DateTime<Utc>, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            job_type: self.job_type.clone(),
            handler_configuration: self.handler_configuration.clone(),
            scope_id: self.scope_id.clone(),
            exclusive: self.exclusive,
            due_date: Some(due_date),
            lock_owner: None,
            lock_expiration_time: None,
            retries_remaining: self.configured_retries,
            configured_retries: self.configured_retries,
            failed_attempts: 0,
            priority: self.priority,
            suspended: self.suspended,
            repeat_interval: self.repeat_interval,
            last_failure_message: None,
            last_failure_details: None,
            revision: 0,
            created_at: now,
        }
    }

    /// Scope used for exclusivity grouping, if the job takes part in it.
    pub fn exclusivity_scope(&self) -> Option<&ScopeId> {
        if self.exclusive {
            self.scope_id.as_ref()
        } else {
            None
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_none_or(|due| due <= now)
    }

    /// Whether some engine holds a lock that has not expired yet.
    pub fn has_live_lock(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration_time.is_some_and(|exp| exp >= now)
    }

    pub fn is_locked_by(&self, owner: &LockOwner) -> bool {
        self.lock_owner.as_ref() == Some(owner)
    }

    /// Eligible for acquisition: due, active, retries left and not held by a live lock.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && !self.suspended && self.retries_remaining > 0 && !self.has_live_lock(now)
    }

    pub fn has_incident(&self) -> bool {
        self.retries_remaining == 0
    }

    pub fn release_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }

    pub fn record_failure(&mut self, message: impl Into<String>, details: Option<String>) {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.last_failure_message = Some(message.into());
        self.last_failure_details = details;
    }
}

/// Durable record of a job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub job_id: JobId,
    pub job_type: String,
    pub scope_id: Option<ScopeId>,
    pub message: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// How many times the job escalated while this incident stayed open
    pub occurrences: u32,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn for_job(job: &Job, message: impl Into<String>, details: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            scope_id: job.scope_id.clone(),
            message: message.into(),
            details,
            created_at: at,
            updated_at: at,
            occurrences: 1,
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
