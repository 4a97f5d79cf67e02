//! Demo handlers for the well-known job types.

use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use jobforge_infra::command_executor::CommandContext;
use jobforge_infra::jobs::{HandlerError, HandlerRegistry, Job, job_types};

/// Payload of a `batch-step` job.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchStep {
    pub batch: String,
    pub step: u32,
    pub total: u32,
}

fn batch_step(job: &Job, ctx: &mut CommandContext<'_>) -> Result<(), HandlerError> {
    let raw = job
        .handler_configuration
        .as_deref()
        .ok_or_else(|| HandlerError::new("batch-step without configuration"))?;
    let step: BatchStep = serde_json::from_str(raw)
        .map_err(|e| HandlerError::new("invalid batch-step configuration").with_details(e.to_string()))?;

    info!(batch = %step.batch, step = step.step, total = step.total, "batch step");

    // Chain the next step into the same transaction.
    if step.step + 1 < step.total {
        let next = serde_json::json!({
            "batch": step.batch,
            "step": step.step + 1,
            "total": step.total,
        });
        let mut follow_up = Job::new(job_types::BATCH_STEP).with_configuration(next.to_string());
        follow_up.scope_id = job.scope_id.clone();
        follow_up.exclusive = job.exclusive;
        ctx.insert_job(follow_up);
    }
    Ok(())
}

/// Registry for the node: timers, continuations and batch steps.
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn(job_types::TIMER_FIRE, |job: &Job, _ctx: &mut CommandContext<'_>| {
            info!(job_id = %job.id, scope = ?job.scope_id, "timer fired");
            Ok(())
        })
        .register_fn(job_types::ASYNC_CONTINUATION, |job: &Job, _ctx: &mut CommandContext<'_>| {
            info!(job_id = %job.id, scope = ?job.scope_id, "continuing process");
            Ok(())
        })
        .register_fn(job_types::BATCH_STEP, batch_step);
    registry
}

/// A few jobs so a fresh node has something to do.
pub fn seed_jobs(default_retries: u32) -> Vec<Job> {
    let batch = serde_json::json!({ "batch": "nightly-import", "step": 0, "total": 5 });
    vec![
        Job::new(job_types::TIMER_FIRE)
            .with_retries(default_retries)
            .repeating(Duration::from_secs(1)),
        Job::new(job_types::ASYNC_CONTINUATION)
            .with_retries(default_retries)
            .in_scope("order-4711", true),
        Job::new(job_types::ASYNC_CONTINUATION)
            .with_retries(default_retries)
            .in_scope("order-4711", true),
        Job::new(job_types::BATCH_STEP)
            .with_retries(default_retries)
            .with_configuration(batch.to_string())
            .in_scope("nightly-import", true),
    ]
}
