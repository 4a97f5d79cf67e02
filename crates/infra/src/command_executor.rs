//! Command execution pipeline (transaction boundary for job mutations).
//!
//! Every mutation of the job table goes through [`CommandExecutor::execute`]:
//! locking during acquisition, running a handler, retry bookkeeping and
//! operator actions all share the same discipline.
//!
//! ```text
//! Command
//!   ↓
//! 1. Open a CommandContext (reads record the revision they observed)
//!   ↓
//! 2. Run the command body (writes are staged, nothing is visible yet)
//!   ↓
//! 3. Body failed / panicked / overran the timeout → discard staged writes
//!   ↓
//! 4. Commit staged writes atomically, each guarded by its observed revision
//!   ↓
//! 5. Notify the incident sink about incidents raised in the commit
//! ```
//!
//! A commit that finds a moved revision (or a row that disappeared) fails with
//! [`CommandError::OptimisticLockingFailure`] instead of overwriting concurrent work.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use jobforge_core::{Clock, ExpectedRevision, JobId, LockOwner, SystemClock};

use crate::jobs::handler::HandlerError;
use crate::jobs::incident::{IncidentSink, LogIncidentSink};
use crate::jobs::store::{JobStore, JobStoreError, JobWrite};
use crate::jobs::types::{Incident, Job};

/// Failure of a command execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// A concurrent writer advanced a revision this command relied on (or
    /// removed the row). Expected under concurrency; never a job failure.
    #[error("optimistic locking failure: {0}")]
    OptimisticLockingFailure(String),

    /// The command body itself failed; its writes were discarded.
    #[error("command failed: {0}")]
    CommandFailure(HandlerError),

    /// The command body ran longer than the transaction timeout.
    #[error("transaction timed out after {elapsed:?} (limit {limit:?})")]
    TransactionTimeout { elapsed: Duration, limit: Duration },

    /// The store could not be reached.
    #[error("job store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store refused the batch for a non-contention reason.
    #[error("job store rejected the commit: {0}")]
    Store(JobStoreError),
}

impl CommandError {
    pub fn is_contention(&self) -> bool {
        matches!(self, CommandError::OptimisticLockingFailure(_))
    }

    pub fn contention(msg: impl Into<String>) -> Self {
        CommandError::OptimisticLockingFailure(msg.into())
    }
}

impl From<JobStoreError> for CommandError {
    fn from(value: JobStoreError) -> Self {
        match value {
            e if e.is_contention() => CommandError::OptimisticLockingFailure(e.to_string()),
            JobStoreError::Unavailable(msg) => CommandError::StoreUnavailable(msg),
            e => CommandError::Store(e),
        }
    }
}

impl From<HandlerError> for CommandError {
    fn from(value: HandlerError) -> Self {
        CommandError::CommandFailure(value)
    }
}

/// Unit of business logic run inside a transaction.
pub trait Command {
    type Output;

    /// Short name for logs.
    fn name(&self) -> &str;

    fn execute(self, ctx: &mut CommandContext<'_>) -> Result<Self::Output, CommandError>;
}

/// Closure commands: `executor.execute(("name", |ctx| { ... }))`.
impl<T, F> Command for (&'static str, F)
where
    F: FnOnce(&mut CommandContext<'_>) -> Result<T, CommandError>,
{
    type Output = T;

    fn name(&self) -> &str {
        self.0
    }

    fn execute(self, ctx: &mut CommandContext<'_>) -> Result<T, CommandError> {
        (self.1)(ctx)
    }
}

/// Transactional view of the job store for one command.
///
/// Reads go straight to the store and remember the revision they saw; writes are
/// staged and only become visible if the whole command commits.
pub struct CommandContext<'a> {
    store: &'a dyn JobStore,
    now: DateTime<Utc>,
    observed: HashMap<JobId, u64>,
    writes: Vec<JobWrite>,
    raised: Vec<Incident>,
}

impl<'a> CommandContext<'a> {
    fn new(store: &'a dyn JobStore, now: DateTime<Utc>) -> Self {
        Self {
            store,
            now,
            observed: HashMap::new(),
            writes: Vec::new(),
            raised: Vec::new(),
        }
    }

    /// Transaction timestamp (fixed for the whole command).
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Read a job and remember its revision for the commit check.
    pub fn find_job(&mut self, job_id: &JobId) -> Result<Option<Job>, CommandError> {
        let job = self.store.get(job_id)?;
        if let Some(job) = &job {
            self.observed.entry(job.id.clone()).or_insert(job.revision);
        }
        Ok(job)
    }

    /// Schedule a new job in the same transaction (continuations, timers).
    pub fn insert_job(&mut self, job: Job) {
        self.writes.push(JobWrite::Insert(job));
    }

    /// Stage an update, guarded by the revision observed when the job was read.
    pub fn update_job(&mut self, job: Job) {
        let expected = self.expected_for(&job.id, job.revision);
        self.writes.push(JobWrite::Update {
            job,
            expected: ExpectedRevision::Exact(expected),
        });
    }

    /// Stage a delete, guarded by the observed revision.
    pub fn delete_job(&mut self, job: &Job) {
        let expected = self.expected_for(&job.id, job.revision);
        self.writes.push(JobWrite::Delete {
            job_id: job.id.clone(),
            expected: ExpectedRevision::Exact(expected),
        });
    }

    /// Stage a delete that ignores revisions (cancellation by business logic).
    pub fn force_delete_job(&mut self, job_id: &JobId) {
        self.writes.push(JobWrite::Delete {
            job_id: job_id.clone(),
            expected: ExpectedRevision::Any,
        });
    }

    /// Stage a lock acquisition for a job observed at `job.revision`.
    pub fn lock_job(&mut self, job: &Job, owner: &LockOwner, expires_at: DateTime<Utc>) {
        self.writes.push(JobWrite::Lock {
            job_id: job.id.clone(),
            expected_revision: job.revision,
            owner: owner.clone(),
            expires_at,
            now: self.now,
        });
    }

    pub fn raise_incident(&mut self, incident: Incident) {
        self.raised.push(incident.clone());
        self.writes.push(JobWrite::RaiseIncident(incident));
    }

    pub fn resolve_incident(&mut self, job_id: &JobId) {
        self.writes.push(JobWrite::ResolveIncident {
            job_id: job_id.clone(),
            at: self.now,
        });
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    fn expected_for(&self, job_id: &JobId, fallback: u64) -> u64 {
        self.observed.get(job_id).copied().unwrap_or(fallback)
    }
}

/// Transaction boundary for all job mutations.
///
/// Generic over the store so tests run against `InMemoryJobStore` and a durable
/// backend can be swapped in without touching callers.
pub struct CommandExecutor<S> {
    store: S,
    clock: Arc<dyn Clock>,
    incident_sink: Arc<dyn IncidentSink>,
    transaction_timeout: Duration,
}

impl<S> CommandExecutor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            incident_sink: Arc::new(LogIncidentSink),
            transaction_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_incident_sink(mut self, sink: Arc<dyn IncidentSink>) -> Self {
        self.incident_sink = sink;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl<S> CommandExecutor<S>
where
    S: JobStore,
{
    /// Run `command` in a transaction.
    ///
    /// Staged writes are discarded on every failure path (error, panic,
    /// timeout); only a body that returns `Ok` within the timeout is committed.
    pub fn execute<C>(&self, command: C) -> Result<C::Output, CommandError>
    where
        C: Command,
    {
        let name = command.name().to_string();
        let started = Instant::now();
        let mut ctx = CommandContext::new(&self.store, self.clock.now());

        let outcome = catch_unwind(AssertUnwindSafe(|| command.execute(&mut ctx)))
            .unwrap_or_else(|panic| Err(CommandError::CommandFailure(HandlerError::from_panic(panic))));

        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                debug!(command = %name, error = %e, "command rolled back");
                return Err(e);
            }
        };

        let elapsed = started.elapsed();
        if elapsed > self.transaction_timeout {
            warn!(command = %name, ?elapsed, "command exceeded transaction timeout, rolled back");
            return Err(CommandError::TransactionTimeout {
                elapsed,
                limit: self.transaction_timeout,
            });
        }

        let CommandContext { writes, raised, .. } = ctx;
        if !writes.is_empty() {
            let count = writes.len();
            self.store.apply(writes).map_err(|e| {
                debug!(command = %name, error = %e, "commit refused");
                CommandError::from(e)
            })?;
            debug!(command = %name, writes = count, "command committed");
        }

        for incident in &raised {
            self.incident_sink.incident_created(incident);
        }

        Ok(output)
    }
}
