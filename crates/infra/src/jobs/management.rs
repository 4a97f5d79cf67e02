//! Operator and business-logic entry points: schedule, cancel, retry, suspend.
//!
//! Every mutation runs through the command executor, so these calls contend
//! with the engine on revisions like any other writer.

use std::sync::Arc;

use tracing::{debug, info};

use jobforge_core::JobId;

use crate::command_executor::{CommandContext, CommandError, CommandExecutor};

use super::acquisition::AcquisitionTrigger;
use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Incident, Job};

const NO_RETRIES_LEFT: &str = "retries set to 0";

pub struct JobManagement<S> {
    executor: Arc<CommandExecutor<S>>,
    trigger: Option<AcquisitionTrigger>,
    default_retries: u32,
}

impl<S> Clone for JobManagement<S> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            trigger: self.trigger.clone(),
            default_retries: self.default_retries,
        }
    }
}

impl<S> JobManagement<S>
where
    S: JobStore,
{
    pub fn new(executor: Arc<CommandExecutor<S>>, default_retries: u32) -> Self {
        Self {
            executor,
            trigger: None,
            default_retries,
        }
    }

    pub fn with_trigger(mut self, trigger: AcquisitionTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// New job of `job_type` carrying the configured default retries.
    pub fn job(&self, job_type: impl Into<String>) -> Job {
        Job::new(job_type).with_retries(self.default_retries)
    }

    /// Persist a new job; wakes acquisition when it is already due.
    ///
    /// A job scheduled without retries is stored with an open incident.
    pub fn schedule(&self, job: Job) -> Result<JobId, CommandError> {
        let id = job.id.clone();
        let due_now = job.is_acquirable(self.executor.now());
        self.executor.execute(("schedule-job", |ctx: &mut CommandContext<'_>| -> Result<(), CommandError> {
            if job.has_incident() {
                let now = ctx.now();
                ctx.raise_incident(Incident::for_job(&job, NO_RETRIES_LEFT, None, now));
            }
            ctx.insert_job(job);
            Ok(())
        }))?;
        debug!(job_id = %id, due_now, "job scheduled");
        if due_now {
            self.wake();
        }
        Ok(id)
    }

    /// Delete a job. Returns `false` if it was already gone.
    ///
    /// An execution already in flight completes, and its commit is dropped as
    /// contention.
    pub fn cancel(&self, job_id: &JobId) -> Result<bool, CommandError> {
        let removed = self.executor.execute(("cancel-job", |ctx: &mut CommandContext<'_>| -> Result<bool, CommandError> {
            if ctx.find_job(job_id)?.is_none() {
                return Ok(false);
            }
            ctx.force_delete_job(job_id);
            Ok(true)
        }));
        match removed {
            Err(e) if e.is_contention() => Ok(false),
            other => other,
        }
    }

    /// Manual retry: set the retries and resolve an open incident.
    ///
    /// Setting retries to 0 on a healthy job opens an incident instead.
    pub fn set_retries(&self, job_id: &JobId, retries: u32) -> Result<Job, CommandError> {
        let job = self.update(job_id, "set-job-retries", |job, ctx| {
            let had_incident = job.has_incident();
            job.retries_remaining = retries;
            if retries > 0 && had_incident {
                ctx.resolve_incident(&job.id);
            } else if retries == 0 && !had_incident {
                let now = ctx.now();
                ctx.raise_incident(Incident::for_job(job, NO_RETRIES_LEFT, None, now));
            }
        })?;
        info!(job_id = %job_id, retries, "job retries set");
        if job.is_acquirable(self.executor.now()) {
            self.wake();
        }
        Ok(job)
    }

    pub fn suspend(&self, job_id: &JobId) -> Result<Job, CommandError> {
        self.update(job_id, "suspend-job", |job, _| job.suspended = true)
    }

    pub fn activate(&self, job_id: &JobId) -> Result<Job, CommandError> {
        let job = self.update(job_id, "activate-job", |job, _| job.suspended = false)?;
        self.wake();
        Ok(job)
    }

    pub fn get(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        self.executor.store().get(job_id)
    }

    pub fn open_incidents(&self) -> Result<Vec<Incident>, JobStoreError> {
        self.executor.store().open_incidents()
    }

    pub fn incidents_for(&self, job_id: &JobId) -> Result<Vec<Incident>, JobStoreError> {
        self.executor.store().incidents_for(job_id)
    }

    pub fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.executor.store().stats(self.executor.now())
    }

    fn update<F>(&self, job_id: &JobId, name: &'static str, change: F) -> Result<Job, CommandError>
    where
        F: FnOnce(&mut Job, &mut CommandContext<'_>),
    {
        self.executor.execute((name, |ctx: &mut CommandContext<'_>| -> Result<Job, CommandError> {
            let mut job = ctx
                .find_job(job_id)?
                .ok_or_else(|| CommandError::Store(JobStoreError::NotFound(job_id.clone())))?;
            change(&mut job, ctx);
            ctx.update_job(job.clone());
            job.revision += 1;
            Ok(job)
        }))
    }

    fn wake(&self) {
        if let Some(trigger) = &self.trigger {
            trigger.fire();
        }
    }
}
