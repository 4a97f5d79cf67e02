//! Acquisition cycle: poll due jobs, lock them, hand them to the pool.
//!
//! ```text
//! Idle ──poll──▶ Polling ──candidates──▶ Locking ──submit──▶ Dispatched ──▶ Idle
//! ```
//!
//! - Locking is an optimistic write through the command executor. Losing the
//!   race to another engine drops the candidate silently.
//! - Exclusive jobs take their scope token before locking; one job per scope is
//!   dispatched per cycle and the next waits for the token to come back.
//! - A rejected submission unlocks the job right away and ends the cycle: the
//!   pool is saturated, so locking more work would only park it.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use jobforge_core::{JobId, LockOwner, ScopeId};

use crate::command_executor::{Command, CommandContext, CommandError, CommandExecutor};

use super::exclusivity::ScopeTokens;
use super::handler::HandlerError;
use super::metrics::JobMetrics;
use super::pool::{DispatchedJob, JobDispatcher};
use super::store::{DueJobQuery, JobStore, JobStoreError};
use super::types::Job;

/// Where the cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Polling,
    Locking,
    Dispatched,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Candidates returned by the poll
    pub polled: usize,
    /// Candidates lost to another engine (or changed/deleted meanwhile)
    pub lost_races: usize,
    /// Exclusive candidates left for a later cycle because their scope is busy
    pub deferred: usize,
    pub dispatched: usize,
    /// Locked but refused by the pool, then unlocked
    pub rejected: usize,
}

impl CycleReport {
    pub fn found_nothing(&self) -> bool {
        self.polled == 0
    }
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("job store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("acquisition failed: {0}")]
    Store(#[from] JobStoreError),

    #[error("acquisition command failed: {0}")]
    Command(CommandError),
}

impl From<CommandError> for AcquisitionError {
    fn from(value: CommandError) -> Self {
        match value {
            CommandError::StoreUnavailable(msg) => AcquisitionError::StoreUnavailable(msg),
            other => AcquisitionError::Command(other),
        }
    }
}

fn poll_error(e: JobStoreError) -> AcquisitionError {
    match e {
        JobStoreError::Unavailable(msg) => AcquisitionError::StoreUnavailable(msg),
        other => AcquisitionError::Store(other),
    }
}

/// Wakes the acquisition loop early (new due job, freed capacity).
///
/// Backed by a capacity-1 channel: pending wake-ups coalesce.
#[derive(Debug, Clone)]
pub struct AcquisitionTrigger {
    tx: SyncSender<()>,
}

impl AcquisitionTrigger {
    pub fn channel() -> (Self, Receiver<()>) {
        let (tx, rx) = mpsc::sync_channel::<()>(1);
        (Self { tx }, rx)
    }

    pub fn fire(&self) {
        // Coalesce: ignore if a wake-up is already pending.
        let _ = self.tx.try_send(());
    }
}

/// Capped exponential wait between empty (or saturated) polls.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    /// Wait to apply now; doubles the following one up to the cap.
    pub fn next_wait(&mut self) -> Duration {
        let wait = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        wait
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Takes the lock on a polled job, guarded by the revision seen at poll time.
pub struct LockJob<'a> {
    pub job: &'a Job,
    pub owner: &'a LockOwner,
    pub lock_duration: Duration,
}

impl Command for LockJob<'_> {
    type Output = ();

    fn name(&self) -> &str {
        "lock-job"
    }

    fn execute(self, ctx: &mut CommandContext<'_>) -> Result<(), CommandError> {
        let lock = chrono::Duration::from_std(self.lock_duration)
            .map_err(|e| CommandError::CommandFailure(HandlerError::new(format!("invalid lock duration: {e}"))))?;
        let expires_at = ctx.now() + lock;
        ctx.lock_job(self.job, self.owner, expires_at);
        Ok(())
    }
}

/// Clears our lock on a job, if we still hold it.
///
/// A job that vanished or moved to another owner is left alone.
pub struct ReleaseLock<'a> {
    pub job_id: &'a JobId,
    pub owner: &'a LockOwner,
}

impl Command for ReleaseLock<'_> {
    type Output = bool;

    fn name(&self) -> &str {
        "release-lock"
    }

    fn execute(self, ctx: &mut CommandContext<'_>) -> Result<bool, CommandError> {
        let Some(mut job) = ctx.find_job(self.job_id)? else {
            return Ok(false);
        };
        if !job.is_locked_by(self.owner) {
            return Ok(false);
        }
        job.release_lock();
        ctx.update_job(job);
        Ok(true)
    }
}

/// One engine's acquisition cycle.
pub struct AcquisitionCycle<S> {
    executor: Arc<CommandExecutor<S>>,
    owner: LockOwner,
    lock_duration: Duration,
    tokens: ScopeTokens,
    metrics: Arc<JobMetrics>,
    state: CycleState,
}

impl<S> AcquisitionCycle<S>
where
    S: JobStore,
{
    pub fn new(
        executor: Arc<CommandExecutor<S>>,
        owner: LockOwner,
        lock_duration: Duration,
        tokens: ScopeTokens,
        metrics: Arc<JobMetrics>,
    ) -> Self {
        Self {
            executor,
            owner,
            lock_duration,
            tokens,
            metrics,
            state: CycleState::Idle,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Run one poll/lock/dispatch pass.
    pub fn acquire(
        &mut self,
        batch_size: usize,
        dispatcher: &dyn JobDispatcher,
    ) -> Result<CycleReport, AcquisitionError> {
        self.metrics.record_cycle();
        let result = self.run_cycle(batch_size, dispatcher);
        self.state = CycleState::Idle;
        if let Err(e) = &result {
            self.metrics.record_store_error();
            error!(engine = %self.owner, error = %e, "acquisition cycle failed");
        }
        result
    }

    fn run_cycle(
        &mut self,
        batch_size: usize,
        dispatcher: &dyn JobDispatcher,
    ) -> Result<CycleReport, AcquisitionError> {
        self.state = CycleState::Polling;
        let query = DueJobQuery {
            now: self.executor.now(),
            limit: batch_size.max(1),
        };
        let candidates = self.executor.store().find_due_jobs(&query).map_err(poll_error)?;

        let mut report = CycleReport {
            polled: candidates.len(),
            ..CycleReport::default()
        };
        if candidates.is_empty() {
            return Ok(report);
        }

        self.state = CycleState::Locking;
        let mut scopes_this_cycle: HashSet<ScopeId> = HashSet::new();

        for candidate in candidates {
            let scope_guard = match candidate.exclusivity_scope() {
                Some(scope) => {
                    if !scopes_this_cycle.insert(scope.clone()) {
                        report.deferred += 1;
                        continue;
                    }
                    match self.tokens.try_acquire(scope) {
                        Some(guard) => Some(guard),
                        None => {
                            report.deferred += 1;
                            continue;
                        }
                    }
                }
                None => None,
            };

            let Some(locked) = self.lock(&candidate)? else {
                report.lost_races += 1;
                continue;
            };

            match dispatcher.dispatch(DispatchedJob::new(locked, scope_guard)) {
                Ok(()) => {
                    self.state = CycleState::Dispatched;
                    report.dispatched += 1;
                    self.metrics.record_acquired(1);
                }
                Err(rejected) => {
                    report.rejected += 1;
                    self.metrics.record_rejected(1);
                    warn!(
                        engine = %self.owner,
                        job_id = %rejected.job.id,
                        "execution pool saturated, releasing lock"
                    );
                    self.release(&rejected.job.id)?;
                    break;
                }
            }
        }

        debug!(
            engine = %self.owner,
            polled = report.polled,
            dispatched = report.dispatched,
            lost = report.lost_races,
            deferred = report.deferred,
            rejected = report.rejected,
            "acquisition cycle finished"
        );
        Ok(report)
    }

    /// Lock `candidate` and return the persisted locked state, or `None` on contention.
    fn lock(&self, candidate: &Job) -> Result<Option<Job>, AcquisitionError> {
        let command = LockJob {
            job: candidate,
            owner: &self.owner,
            lock_duration: self.lock_duration,
        };
        match self.executor.execute(command) {
            Ok(()) => {}
            Err(e) if e.is_contention() => {
                debug!(engine = %self.owner, job_id = %candidate.id, "lost lock race");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let locked = self
            .executor
            .store()
            .get(&candidate.id)
            .map_err(poll_error)?
            .filter(|job| job.is_locked_by(&self.owner));
        Ok(locked)
    }

    fn release(&self, job_id: &JobId) -> Result<(), AcquisitionError> {
        let command = ReleaseLock {
            job_id,
            owner: &self.owner,
        };
        match self.executor.execute(command) {
            Ok(_) => Ok(()),
            Err(e) if e.is_contention() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use std::sync::Mutex;

    /// Accepts up to `capacity` jobs, then rejects.
    struct FakePool {
        capacity: usize,
        taken: Mutex<Vec<DispatchedJob>>,
    }

    impl FakePool {
        fn new(capacity: usize) -> Self {
            Self {
                capacity,
                taken: Mutex::new(Vec::new()),
            }
        }

        fn ids(&self) -> Vec<String> {
            self.taken
                .lock()
                .unwrap()
                .iter()
                .map(|d| d.job.id.to_string())
                .collect()
        }

        fn finish_all(&self) {
            self.taken.lock().unwrap().clear();
        }
    }

    impl JobDispatcher for FakePool {
        fn dispatch(&self, job: DispatchedJob) -> Result<(), DispatchedJob> {
            let mut taken = self.taken.lock().unwrap();
            if taken.len() >= self.capacity {
                return Err(job);
            }
            taken.push(job);
            Ok(())
        }

        fn utilization(&self) -> f64 {
            self.taken.lock().unwrap().len() as f64 / self.capacity.max(1) as f64
        }
    }

    fn cycle(store: Arc<InMemoryJobStore>, owner: &str) -> AcquisitionCycle<Arc<InMemoryJobStore>> {
        AcquisitionCycle::new(
            Arc::new(CommandExecutor::new(store)),
            LockOwner::from(owner),
            Duration::from_secs(300),
            ScopeTokens::new(),
            Arc::new(JobMetrics::new()),
        )
    }

    #[test]
    fn locks_and_dispatches_due_jobs_in_priority_order() {
        let store = InMemoryJobStore::arc();
        store.insert(Job::new("t").with_id("low").with_priority(1)).unwrap();
        store.insert(Job::new("t").with_id("high").with_priority(5)).unwrap();
        let pool = FakePool::new(10);
        let mut cycle = cycle(store.clone(), "engine-a");

        let report = cycle.acquire(10, &pool).unwrap();

        assert_eq!(report.dispatched, 2);
        assert_eq!(pool.ids(), vec!["high", "low"]);
        let high = store.get(&JobId::from("high")).unwrap().unwrap();
        assert!(high.is_locked_by(&LockOwner::from("engine-a")));
        assert_eq!(cycle.state(), CycleState::Idle);
    }

    #[test]
    fn one_exclusive_job_per_scope_until_completion() {
        let store = InMemoryJobStore::arc();
        store.insert(Job::new("t").with_id("J2").in_scope("P1", true).with_priority(2)).unwrap();
        store.insert(Job::new("t").with_id("J3").in_scope("P1", true).with_priority(1)).unwrap();
        let pool = FakePool::new(10);
        let mut cycle = cycle(store.clone(), "engine-a");

        let first = cycle.acquire(10, &pool).unwrap();
        assert_eq!(first.dispatched, 1);
        assert_eq!(first.deferred, 1);
        assert_eq!(pool.ids(), vec!["J2"]);

        // J2 still running: J3 must wait.
        let second = cycle.acquire(10, &pool).unwrap();
        assert_eq!(second.dispatched, 0);

        // J2 completes: job row removed, scope token returned.
        store.delete(&JobId::from("J2"), jobforge_core::ExpectedRevision::Any).unwrap();
        pool.finish_all();

        let third = cycle.acquire(10, &pool).unwrap();
        assert_eq!(third.dispatched, 1);
        assert_eq!(pool.ids(), vec!["J3"]);
    }

    #[test]
    fn rejected_job_is_unlocked_and_cycle_stops() {
        let store = InMemoryJobStore::arc();
        store.insert(Job::new("t").with_id("J1").with_priority(3)).unwrap();
        store.insert(Job::new("t").with_id("J2").with_priority(2)).unwrap();
        store.insert(Job::new("t").with_id("J3").with_priority(1)).unwrap();
        let pool = FakePool::new(1);
        let mut cycle = cycle(store.clone(), "engine-a");

        let report = cycle.acquire(10, &pool).unwrap();

        assert_eq!(report.dispatched, 1);
        assert_eq!(report.rejected, 1);
        let j2 = store.get(&JobId::from("J2")).unwrap().unwrap();
        assert!(j2.lock_owner.is_none());
        let j3 = store.get(&JobId::from("J3")).unwrap().unwrap();
        assert!(j3.lock_owner.is_none());
    }

    #[test]
    fn competing_engines_split_the_work() {
        let store = InMemoryJobStore::arc();
        store.insert(Job::new("t").with_id("J1")).unwrap();
        let pool_a = FakePool::new(10);
        let pool_b = FakePool::new(10);
        let mut a = cycle(store.clone(), "engine-a");
        let mut b = cycle(store.clone(), "engine-b");

        let ra = a.acquire(10, &pool_a).unwrap();
        let rb = b.acquire(10, &pool_b).unwrap();

        assert_eq!(ra.dispatched + rb.dispatched, 1);
        assert!(rb.found_nothing());
    }

    #[test]
    fn store_outage_is_reported_not_panicked() {
        let store = InMemoryJobStore::arc();
        store.set_available(false);
        let pool = FakePool::new(1);
        let mut cycle = cycle(store, "engine-a");

        let err = cycle.acquire(10, &pool).unwrap_err();
        assert!(matches!(err, AcquisitionError::StoreUnavailable(_)));
        assert_eq!(cycle.state(), CycleState::Idle);
    }

    #[test]
    fn idle_backoff_doubles_to_cap_and_resets() {
        let mut backoff = IdleBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.next_wait(), Duration::from_millis(100));
        assert_eq!(backoff.next_wait(), Duration::from_millis(200));
        assert_eq!(backoff.next_wait(), Duration::from_millis(400));
        assert_eq!(backoff.next_wait(), Duration::from_millis(500));
        assert_eq!(backoff.next_wait(), Duration::from_millis(500));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(100));
    }

    #[test]
    fn triggers_coalesce() {
        let (trigger, rx) = AcquisitionTrigger::channel();
        trigger.fire();
        trigger.fire();
        trigger.fire();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
