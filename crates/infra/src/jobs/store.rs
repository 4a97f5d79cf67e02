//! Job storage boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use jobforge_core::{ExpectedRevision, JobId, LockOwner, ScopeId};

use super::types::{Incident, Job};

/// Criteria for an acquisition poll.
#[derive(Debug, Clone)]
pub struct DueJobQuery {
    pub now: DateTime<Utc>,
    pub limit: usize,
}

/// A single mutation inside an atomic [`JobStore::apply`] batch.
#[derive(Debug, Clone)]
pub enum JobWrite {
    /// Persist a new job (assigned revision 1).
    Insert(Job),
    /// Replace a job, guarded by its revision.
    Update { job: Job, expected: ExpectedRevision },
    /// Take the lock on a job observed at `expected_revision`.
    ///
    /// Refused when the revision moved, when a live lock is held, or when the job
    /// is exclusive and another exclusive job of its scope holds a live lock.
    Lock {
        job_id: JobId,
        expected_revision: u64,
        owner: LockOwner,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    },
    Delete { job_id: JobId, expected: ExpectedRevision },
    /// Open an incident, or bump the open one for the same job.
    RaiseIncident(Incident),
    ResolveIncident { job_id: JobId, at: DateTime<Utc> },
}

impl JobWrite {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobWrite::Insert(job) => &job.id,
            JobWrite::Update { job, .. } => &job.id,
            JobWrite::Lock { job_id, .. } => job_id,
            JobWrite::Delete { job_id, .. } => job_id,
            JobWrite::RaiseIncident(incident) => &incident.job_id,
            JobWrite::ResolveIncident { job_id, .. } => job_id,
        }
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("stale revision for job {job_id}: expected {expected:?}, found {actual}")]
    Conflict {
        job_id: JobId,
        expected: ExpectedRevision,
        actual: u64,
    },
    #[error("job {job_id} is already locked by {owner}")]
    AlreadyLocked { job_id: JobId, owner: LockOwner },
    #[error("exclusive scope {scope} is busy, job {job_id} must wait")]
    ExclusiveScopeBusy { job_id: JobId, scope: ScopeId },
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

impl JobStoreError {
    /// Lost a race against a concurrent writer (expected under concurrency).
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            JobStoreError::NotFound(_)
                | JobStoreError::Conflict { .. }
                | JobStoreError::AlreadyLocked { .. }
                | JobStoreError::ExclusiveScopeBusy { .. }
        )
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub total: usize,
    pub due: usize,
    pub scheduled: usize,
    pub locked: usize,
    pub suspended: usize,
    pub with_incident: usize,
    pub open_incidents: usize,
}

/// Persistence for jobs and incidents.
///
/// The store is the single shared mutable resource between engine instances;
/// implementations must make [`JobStore::apply`] atomic (all writes or none) and
/// enforce revisions so that stale writers fail instead of overwriting.
pub trait JobStore: Send + Sync {
    fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError>;

    /// Up to `limit` acquirable jobs, ordered by priority desc then due date asc.
    fn find_due_jobs(&self, query: &DueJobQuery) -> Result<Vec<Job>, JobStoreError>;

    /// Apply a batch atomically. Returns the persisted state of every inserted,
    /// updated or locked job, in batch order.
    fn apply(&self, writes: Vec<JobWrite>) -> Result<Vec<Job>, JobStoreError>;

    fn open_incidents(&self) -> Result<Vec<Incident>, JobStoreError>;

    fn incidents_for(&self, job_id: &JobId) -> Result<Vec<Incident>, JobStoreError>;

    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError>;

    fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let id = job.id.clone();
        self.apply(vec![JobWrite::Insert(job)])?
            .pop()
            .ok_or(JobStoreError::NotFound(id))
    }

    /// Save a job read at `job.revision`.
    fn save(&self, job: &Job) -> Result<Job, JobStoreError> {
        let write = JobWrite::Update {
            job: job.clone(),
            expected: ExpectedRevision::Exact(job.revision),
        };
        self.apply(vec![write])?
            .pop()
            .ok_or_else(|| JobStoreError::NotFound(job.id.clone()))
    }

    /// Returns `false` when another writer got there first.
    fn try_lock(
        &self,
        job_id: &JobId,
        expected_revision: u64,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let write = JobWrite::Lock {
            job_id: job_id.clone(),
            expected_revision,
            owner: owner.clone(),
            expires_at,
            now,
        };
        match self.apply(vec![write]) {
            Ok(_) => Ok(true),
            Err(e) if e.is_contention() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, job_id: &JobId, expected: ExpectedRevision) -> Result<(), JobStoreError> {
        self.apply(vec![JobWrite::Delete {
            job_id: job_id.clone(),
            expected,
        }])
        .map(|_| ())
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn find_due_jobs(&self, query: &DueJobQuery) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_due_jobs(query)
    }

    fn apply(&self, writes: Vec<JobWrite>) -> Result<Vec<Job>, JobStoreError> {
        (**self).apply(writes)
    }

    fn open_incidents(&self) -> Result<Vec<Incident>, JobStoreError> {
        (**self).open_incidents()
    }

    fn incidents_for(&self, job_id: &JobId) -> Result<Vec<Incident>, JobStoreError> {
        (**self).incidents_for(job_id)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        (**self).stats(now)
    }
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    incidents: Vec<Incident>,
}

/// In-memory job store for tests/dev.
///
/// Shared between simulated engine instances via `Arc`. Can be switched to an
/// unavailable mode to exercise outage handling.
#[derive(Debug)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: every operation fails with `Unavailable` while off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn all_jobs(&self) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let mut jobs: Vec<_> = tables.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    fn check_available(&self) -> Result<(), JobStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(JobStoreError::Unavailable("in-memory store switched off".to_string()))
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, JobStoreError> {
        self.check_available()?;
        self.tables
            .read()
            .map_err(|_| JobStoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, JobStoreError> {
        self.check_available()?;
        self.tables
            .write()
            .map_err(|_| JobStoreError::Unavailable("lock poisoned".to_string()))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending view of the job table while a batch is validated.
struct Overlay<'a> {
    base: &'a HashMap<JobId, Job>,
    staged: HashMap<JobId, Option<Job>>,
}

impl<'a> Overlay<'a> {
    fn new(base: &'a HashMap<JobId, Job>) -> Self {
        Self {
            base,
            staged: HashMap::new(),
        }
    }

    fn get(&self, id: &JobId) -> Option<&Job> {
        match self.staged.get(id) {
            Some(staged) => staged.as_ref(),
            None => self.base.get(id),
        }
    }

    fn put(&mut self, job: Job) {
        self.staged.insert(job.id.clone(), Some(job));
    }

    fn remove(&mut self, id: &JobId) {
        self.staged.insert(id.clone(), None);
    }

    /// Another exclusive job of `scope` currently holds a live lock.
    fn scope_busy(&self, scope: &ScopeId, except: &JobId, now: DateTime<Utc>) -> bool {
        let holds = |job: &Job| {
            &job.id != except
                && job.exclusivity_scope() == Some(scope)
                && job.has_live_lock(now)
        };
        let staged_busy = self.staged.values().flatten().any(holds);
        let base_busy = self
            .base
            .values()
            .filter(|job| !self.staged.contains_key(&job.id))
            .any(holds);
        staged_busy || base_busy
    }
}

fn check_revision(job_id: &JobId, expected: ExpectedRevision, actual: u64) -> Result<(), JobStoreError> {
    if expected.matches(actual) {
        Ok(())
    } else {
        Err(JobStoreError::Conflict {
            job_id: job_id.clone(),
            expected,
            actual,
        })
    }
}

impl JobStore for InMemoryJobStore {
    fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(job_id).cloned())
    }

    fn find_due_jobs(&self, query: &DueJobQuery) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let now = query.now;

        // Scopes whose exclusive work is already running somewhere.
        let busy_scopes: Vec<&ScopeId> = tables
            .jobs
            .values()
            .filter(|j| j.has_live_lock(now))
            .filter_map(Job::exclusivity_scope)
            .collect();

        let mut candidates: Vec<&Job> = tables
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .filter(|j| j.exclusivity_scope().is_none_or(|s| !busy_scopes.contains(&s)))
            .collect();

        // Priority first, then earliest due (no due date counts as earliest), then FIFO.
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.due_date.cmp(&b.due_date))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(candidates.into_iter().take(query.limit).cloned().collect())
    }

    fn apply(&self, writes: Vec<JobWrite>) -> Result<Vec<Job>, JobStoreError> {
        if writes.is_empty() {
            return Ok(vec![]);
        }

        let mut tables = self.write()?;
        let mut persisted = Vec::new();
        let mut incident_ops = Vec::new();

        // 1) Validate against a staged overlay (nothing visible yet).
        let staged = {
            let mut overlay = Overlay::new(&tables.jobs);
            for write in writes {
                match write {
                    JobWrite::Insert(mut job) => {
                        if overlay.get(&job.id).is_some() {
                            return Err(JobStoreError::AlreadyExists(job.id));
                        }
                        job.revision = 1;
                        persisted.push(job.clone());
                        overlay.put(job);
                    }
                    JobWrite::Update { mut job, expected } => {
                        let current = overlay
                            .get(&job.id)
                            .ok_or_else(|| JobStoreError::NotFound(job.id.clone()))?;
                        check_revision(&job.id, expected, current.revision)?;
                        job.revision = current.revision + 1;
                        persisted.push(job.clone());
                        overlay.put(job);
                    }
                    JobWrite::Lock {
                        job_id,
                        expected_revision,
                        owner,
                        expires_at,
                        now,
                    } => {
                        let current = overlay
                            .get(&job_id)
                            .ok_or_else(|| JobStoreError::NotFound(job_id.clone()))?;
                        check_revision(&job_id, ExpectedRevision::Exact(expected_revision), current.revision)?;
                        if current.has_live_lock(now) {
                            return Err(JobStoreError::AlreadyLocked {
                                owner: current.lock_owner.clone().unwrap_or_else(|| LockOwner::from("unknown")),
                                job_id,
                            });
                        }
                        if let Some(scope) = current.exclusivity_scope() {
                            if overlay.scope_busy(scope, &job_id, now) {
                                return Err(JobStoreError::ExclusiveScopeBusy {
                                    scope: scope.clone(),
                                    job_id,
                                });
                            }
                        }
                        let mut locked = current.clone();
                        locked.lock_owner = Some(owner);
                        locked.lock_expiration_time = Some(expires_at);
                        locked.revision += 1;
                        persisted.push(locked.clone());
                        overlay.put(locked);
                    }
                    JobWrite::Delete { job_id, expected } => {
                        let current = overlay
                            .get(&job_id)
                            .ok_or_else(|| JobStoreError::NotFound(job_id.clone()))?;
                        check_revision(&job_id, expected, current.revision)?;
                        overlay.remove(&job_id);
                    }
                    op @ (JobWrite::RaiseIncident(_) | JobWrite::ResolveIncident { .. }) => {
                        incident_ops.push(op);
                    }
                }
            }
            overlay.staged
        };

        // 2) Commit.
        for (id, job) in staged {
            match job {
                Some(job) => {
                    tables.jobs.insert(id, job);
                }
                None => {
                    tables.jobs.remove(&id);
                }
            }
        }

        for op in incident_ops {
            match op {
                JobWrite::RaiseIncident(incident) => {
                    let open = tables
                        .incidents
                        .iter_mut()
                        .find(|i| i.job_id == incident.job_id && i.is_open());
                    match open {
                        Some(existing) => {
                            existing.message = incident.message;
                            existing.details = incident.details;
                            existing.updated_at = incident.updated_at;
                            existing.occurrences += 1;
                        }
                        None => tables.incidents.push(incident),
                    }
                }
                JobWrite::ResolveIncident { job_id, at } => {
                    for incident in tables
                        .incidents
                        .iter_mut()
                        .filter(|i| i.job_id == job_id && i.is_open())
                    {
                        incident.resolved_at = Some(at);
                        incident.updated_at = at;
                    }
                }
                _ => {}
            }
        }

        Ok(persisted)
    }

    fn open_incidents(&self) -> Result<Vec<Incident>, JobStoreError> {
        let tables = self.read()?;
        let mut open: Vec<_> = tables.incidents.iter().filter(|i| i.is_open()).cloned().collect();
        open.sort_by_key(|i| i.created_at);
        Ok(open)
    }

    fn incidents_for(&self, job_id: &JobId) -> Result<Vec<Incident>, JobStoreError> {
        let tables = self.read()?;
        Ok(tables
            .incidents
            .iter()
            .filter(|i| &i.job_id == job_id)
            .cloned()
            .collect())
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let tables = self.read()?;
        let mut stats = JobStats {
            total: tables.jobs.len(),
            ..JobStats::default()
        };

        for job in tables.jobs.values() {
            if job.has_live_lock(now) {
                stats.locked += 1;
            }
            if job.suspended {
                stats.suspended += 1;
            }
            if job.has_incident() {
                stats.with_incident += 1;
            }
            if job.is_acquirable(now) {
                stats.due += 1;
            } else if !job.is_due(now) {
                stats.scheduled += 1;
            }
        }
        stats.open_incidents = tables.incidents.iter().filter(|i| i.is_open()).count();

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn owner(name: &str) -> LockOwner {
        LockOwner::from(name)
    }

    fn query(now: DateTime<Utc>) -> DueJobQuery {
        DueJobQuery { now, limit: 10 }
    }

    #[test]
    fn insert_assigns_first_revision() {
        let store = InMemoryJobStore::new();
        let job = store.insert(Job::new("t").with_id("J1")).unwrap();
        assert_eq!(job.revision, 1);
        assert!(matches!(
            store.insert(Job::new("t").with_id("J1")),
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn stale_save_is_refused() {
        let store = InMemoryJobStore::new();
        let job = store.insert(Job::new("t").with_id("J1")).unwrap();

        let mut first = job.clone();
        first.priority = 5;
        let saved = store.save(&first).unwrap();
        assert_eq!(saved.revision, 2);

        let mut stale = job;
        stale.priority = 9;
        let err = store.save(&stale).unwrap_err();
        assert!(err.is_contention());
        assert_eq!(store.get(&JobId::from("J1")).unwrap().unwrap().priority, 5);
    }

    #[test]
    fn due_jobs_ordered_by_priority_then_due_date() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert(Job::new("t").with_id("low").due_at(now - Duration::seconds(30))).unwrap();
        store
            .insert(Job::new("t").with_id("high-late").with_priority(10).due_at(now - Duration::seconds(1)))
            .unwrap();
        store
            .insert(Job::new("t").with_id("high-early").with_priority(10).due_at(now - Duration::seconds(5)))
            .unwrap();
        store.insert(Job::new("t").with_id("future").due_at(now + Duration::seconds(60))).unwrap();

        let ids: Vec<_> = store
            .find_due_jobs(&query(now))
            .unwrap()
            .into_iter()
            .map(|j| j.id.into_inner())
            .collect();

        assert_eq!(ids, vec!["high-early", "high-late", "low"]);
    }

    #[test]
    fn due_jobs_respect_limit() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store.insert(Job::new("t").with_id(format!("J{i}"))).unwrap();
        }
        let found = store.find_due_jobs(&DueJobQuery { now: Utc::now(), limit: 2 }).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn lock_race_has_single_winner() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.insert(Job::new("t").with_id("J2")).unwrap();
        let expiry = now + Duration::minutes(5);

        assert!(store.try_lock(&job.id, job.revision, &owner("a"), expiry, now).unwrap());
        assert!(!store.try_lock(&job.id, job.revision, &owner("b"), expiry, now).unwrap());

        let locked = store.get(&job.id).unwrap().unwrap();
        assert_eq!(locked.lock_owner, Some(owner("a")));
        assert!(store.find_due_jobs(&query(now)).unwrap().is_empty());
    }

    #[test]
    fn expired_lock_can_be_reclaimed() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.insert(Job::new("t").with_id("J")).unwrap();
        assert!(store.try_lock(&job.id, 1, &owner("a"), now + Duration::seconds(1), now).unwrap());

        let later = now + Duration::seconds(5);
        let candidates = store.find_due_jobs(&query(later)).unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(store
            .try_lock(&job.id, candidates[0].revision, &owner("b"), later + Duration::minutes(1), later)
            .unwrap());
        assert_eq!(store.get(&job.id).unwrap().unwrap().lock_owner, Some(owner("b")));
    }

    #[test]
    fn exclusive_scope_allows_one_live_lock() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let a = store.insert(Job::new("t").with_id("J3a").in_scope("P1", true)).unwrap();
        let b = store.insert(Job::new("t").with_id("J3b").in_scope("P1", true)).unwrap();
        let other = store.insert(Job::new("t").with_id("J3c").in_scope("P2", true)).unwrap();
        let expiry = now + Duration::minutes(5);

        assert!(store.try_lock(&a.id, a.revision, &owner("a"), expiry, now).unwrap());
        assert!(!store.try_lock(&b.id, b.revision, &owner("b"), expiry, now).unwrap());
        assert!(store.try_lock(&other.id, other.revision, &owner("b"), expiry, now).unwrap());

        // J3b is hidden from polls while its scope is busy.
        let ids: Vec<_> = store.find_due_jobs(&query(now)).unwrap().into_iter().map(|j| j.id).collect();
        assert!(ids.is_empty());

        store.delete(&a.id, ExpectedRevision::Any).unwrap();
        let ids: Vec<_> = store.find_due_jobs(&query(now)).unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![b.id]);
    }

    #[test]
    fn non_exclusive_jobs_share_scope_freely() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let a = store.insert(Job::new("t").in_scope("P1", false)).unwrap();
        let b = store.insert(Job::new("t").in_scope("P1", false)).unwrap();
        let expiry = now + Duration::minutes(5);

        assert!(store.try_lock(&a.id, a.revision, &owner("a"), expiry, now).unwrap());
        assert!(store.try_lock(&b.id, b.revision, &owner("b"), expiry, now).unwrap());
    }

    #[test]
    fn failed_batch_leaves_nothing_behind() {
        let store = InMemoryJobStore::new();
        let existing = store.insert(Job::new("t").with_id("J1")).unwrap();

        let result = store.apply(vec![
            JobWrite::Insert(Job::new("t").with_id("J-new")),
            JobWrite::Update {
                job: existing.clone(),
                expected: ExpectedRevision::Exact(99),
            },
        ]);

        assert!(matches!(result, Err(JobStoreError::Conflict { .. })));
        assert!(store.get(&JobId::from("J-new")).unwrap().is_none());
        assert_eq!(store.get(&existing.id).unwrap().unwrap().revision, 1);
    }

    #[test]
    fn delete_of_missing_job_is_contention() {
        let store = InMemoryJobStore::new();
        let err = store.delete(&JobId::from("gone"), ExpectedRevision::Any).unwrap_err();
        assert!(err.is_contention());
    }

    #[test]
    fn incidents_are_upserted_and_resolved() {
        let store = InMemoryJobStore::new();
        let job = store.insert(Job::new("t").with_id("J4")).unwrap();
        let now = Utc::now();

        store
            .apply(vec![JobWrite::RaiseIncident(Incident::for_job(&job, "boom", None, now))])
            .unwrap();
        store
            .apply(vec![JobWrite::RaiseIncident(Incident::for_job(&job, "boom again", None, now))])
            .unwrap();

        let open = store.open_incidents().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].occurrences, 2);
        assert_eq!(open[0].message, "boom again");

        store
            .apply(vec![JobWrite::ResolveIncident { job_id: job.id.clone(), at: now }])
            .unwrap();
        assert!(store.open_incidents().unwrap().is_empty());
        assert_eq!(store.incidents_for(&job.id).unwrap().len(), 1);
    }

    #[test]
    fn unavailable_store_fails_every_operation() {
        let store = InMemoryJobStore::new();
        store.set_available(false);
        assert!(matches!(
            store.find_due_jobs(&query(Utc::now())),
            Err(JobStoreError::Unavailable(_))
        ));
        assert!(matches!(store.insert(Job::new("t")), Err(JobStoreError::Unavailable(_))));

        store.set_available(true);
        assert!(store.insert(Job::new("t")).is_ok());
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert(Job::new("t")).unwrap();
        store.insert(Job::new("t").due_at(now + Duration::hours(1))).unwrap();
        store.insert(Job::new("t").suspended(true)).unwrap();
        store.insert(Job::new("t").with_retries(0)).unwrap();
        let locked = store.insert(Job::new("t")).unwrap();
        store
            .try_lock(&locked.id, locked.revision, &owner("a"), now + Duration::minutes(1), now)
            .unwrap();

        let stats = store.stats(now).unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.due, 1);
        assert_eq!(stats.scheduled, 1);
        assert_eq!(stats.suspended, 1);
        assert_eq!(stats.with_incident, 1);
        assert_eq!(stats.locked, 1);
    }
}
