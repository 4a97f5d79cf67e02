//! Executes one dispatched job and settles its outcome.
//!
//! The handler runs inside an `ExecuteJob` command, so its own writes and the
//! job's completion commit together. What happens next depends on the
//! [`ExecutionOutcome`]:
//!
//! - `Committed`: nothing left to do.
//! - `Contention`: release our lock in a fresh transaction, retries untouched.
//! - `HandlerFailed`: hand over to the failure policy, again in a fresh
//!   transaction.
//!
//! The scope token is returned and acquisition woken up in every case.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use jobforge_core::{JobId, LockOwner};

use crate::command_executor::{Command, CommandContext, CommandError, CommandExecutor};

use super::acquisition::{AcquisitionTrigger, ReleaseLock};
use super::handler::{HandlerError, HandlerRegistry, JobHandler};
use super::metrics::JobMetrics;
use super::pool::{DispatchedJob, JobWorker};
use super::retry::{FailureOutcome, FailurePolicy, RecordFailure};
use super::store::JobStore;
use super::types::Job;

/// How a job left the executing transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Committed(Completion),
    /// The job changed, moved to another owner, or was deleted meanwhile.
    Contention,
    HandlerFailed(HandlerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Deleted,
    /// A recurring job was replaced by its next run.
    Rescheduled { next: JobId, due_date: DateTime<Utc> },
}

/// Runs the handler for a locked job and completes it in one transaction.
struct ExecuteJob<'a> {
    job: &'a Job,
    owner: &'a LockOwner,
    handler: &'a dyn JobHandler,
}

impl Command for ExecuteJob<'_> {
    type Output = Completion;

    fn name(&self) -> &str {
        "execute-job"
    }

    fn execute(self, ctx: &mut CommandContext<'_>) -> Result<Completion, CommandError> {
        let Some(current) = ctx.find_job(&self.job.id)? else {
            return Err(CommandError::contention(format!("job {} was deleted", self.job.id)));
        };
        if current.revision != self.job.revision || !current.is_locked_by(self.owner) {
            return Err(CommandError::contention(format!(
                "job {} changed since it was locked (revision {} -> {})",
                current.id, self.job.revision, current.revision
            )));
        }

        self.handler.handle(&current, ctx)?;

        match current.repeat_interval {
            Some(interval) => {
                let now = ctx.now();
                let due_date = next_occurrence(&current, now, interval);
                let next = current.next_run(due_date, now);
                let next_id = next.id.clone();
                ctx.delete_job(&current);
                ctx.insert_job(next);
                Ok(Completion::Rescheduled { next: next_id, due_date })
            }
            None => {
                ctx.delete_job(&current);
                Ok(Completion::Deleted)
            }
        }
    }
}

/// `due_date + interval`, skipping occurrences already in the past.
/// Intervals beyond chrono's range never fire again.
fn next_occurrence(job: &Job, now: DateTime<Utc>, interval: std::time::Duration) -> DateTime<Utc> {
    let Ok(step) = chrono::Duration::from_std(interval) else {
        return DateTime::<Utc>::MAX_UTC;
    };
    let base = job.due_date.unwrap_or(now);
    match base.checked_add_signed(step) {
        Some(next) if next > now => next,
        _ => now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC),
    }
}

/// Pool worker: execute, then settle contention or failure.
pub struct JobRunner<S> {
    executor: Arc<CommandExecutor<S>>,
    registry: Arc<HandlerRegistry>,
    failure_policy: FailurePolicy,
    owner: LockOwner,
    metrics: Arc<JobMetrics>,
    trigger: Option<AcquisitionTrigger>,
}

impl<S> JobRunner<S>
where
    S: JobStore,
{
    pub fn new(
        executor: Arc<CommandExecutor<S>>,
        registry: Arc<HandlerRegistry>,
        failure_policy: FailurePolicy,
        owner: LockOwner,
        metrics: Arc<JobMetrics>,
    ) -> Self {
        Self {
            executor,
            registry,
            failure_policy,
            owner,
            metrics,
            trigger: None,
        }
    }

    /// Wake acquisition whenever a job finishes.
    pub fn with_trigger(mut self, trigger: AcquisitionTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Run the handler transaction. `Err` means the store itself failed.
    pub fn execute(&self, job: &Job) -> Result<ExecutionOutcome, CommandError> {
        let Some(handler) = self.registry.resolve(&job.job_type) else {
            return Ok(ExecutionOutcome::HandlerFailed(HandlerError::new(format!(
                "no handler registered for job type '{}'",
                job.job_type
            ))));
        };

        let command = ExecuteJob {
            job,
            owner: &self.owner,
            handler: handler.as_ref(),
        };
        match self.executor.execute(command) {
            Ok(completion) => Ok(ExecutionOutcome::Committed(completion)),
            Err(CommandError::OptimisticLockingFailure(reason)) => {
                debug!(job_id = %job.id, reason = %reason, "execution lost to contention");
                Ok(ExecutionOutcome::Contention)
            }
            Err(CommandError::CommandFailure(e)) => Ok(ExecutionOutcome::HandlerFailed(e)),
            Err(e @ CommandError::TransactionTimeout { .. }) => {
                Ok(ExecutionOutcome::HandlerFailed(HandlerError::new(e.to_string())))
            }
            Err(e) => Err(e),
        }
    }

    /// Execute `dispatched` and settle the outcome.
    pub fn run_job(&self, dispatched: DispatchedJob) -> Result<ExecutionOutcome, CommandError> {
        let DispatchedJob { job, scope_guard } = dispatched;
        let result = self.execute(&job).and_then(|outcome| {
            self.settle(&job, &outcome)?;
            Ok(outcome)
        });

        drop(scope_guard);
        if let Some(trigger) = &self.trigger {
            trigger.fire();
        }
        result
    }

    fn settle(&self, job: &Job, outcome: &ExecutionOutcome) -> Result<(), CommandError> {
        match outcome {
            ExecutionOutcome::Committed(completion) => {
                self.metrics.record_executed();
                debug!(job_id = %job.id, job_type = %job.job_type, ?completion, "job completed");
                Ok(())
            }
            ExecutionOutcome::Contention => {
                self.metrics.record_contention();
                let release = ReleaseLock {
                    job_id: &job.id,
                    owner: &self.owner,
                };
                match self.executor.execute(release) {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_contention() => Ok(()),
                    Err(e) => Err(e),
                }
            }
            ExecutionOutcome::HandlerFailed(err) => {
                self.metrics.record_failed();
                warn!(job_id = %job.id, job_type = %job.job_type, error = %err, "job handler failed");
                let record = RecordFailure {
                    job_id: job.id.clone(),
                    owner: self.owner.clone(),
                    error: err.clone(),
                    handler: self.registry.resolve(&job.job_type),
                    policy: &self.failure_policy,
                };
                match self.executor.execute(record) {
                    Ok(FailureOutcome::IncidentCreated) => {
                        self.metrics.record_incident();
                        Ok(())
                    }
                    Ok(_) => Ok(()),
                    Err(e) if e.is_contention() => {
                        debug!(job_id = %job.id, error = %e, "failure bookkeeping lost to contention");
                        self.metrics.record_contention();
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}

impl<S> JobWorker for JobRunner<S>
where
    S: JobStore + 'static,
{
    fn run(&self, job: DispatchedJob) {
        let job_id = job.job.id.clone();
        if let Err(e) = self.run_job(job) {
            // The lock is left to expire; another cycle will pick the job up.
            self.metrics.record_store_error();
            error!(job_id = %job_id, error = %e, "could not settle job execution");
        }
    }
}
