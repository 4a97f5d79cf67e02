use std::thread;
use std::time::Duration;

use anyhow::Context;

use jobforge_infra::config::EngineConfig;
use jobforge_infra::jobs::{InMemoryJobStore, JobEngine};

mod handlers;

fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = EngineConfig::from_env().context("loading engine configuration")?;
    let run_for = std::env::var("JOBFORGE_RUN_SECS")
        .ok()
        .map(|v| v.parse::<u64>())
        .transpose()
        .context("JOBFORGE_RUN_SECS must be a number of seconds")?
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(5));

    let store = InMemoryJobStore::arc();
    let engine = JobEngine::new(store, handlers::registry(), config.clone())
        .spawn()
        .context("starting job engine")?;

    for job in handlers::seed_jobs(config.default_retries) {
        engine.management().schedule(job).context("scheduling seed job")?;
    }

    tracing::info!(engine = %engine.owner(), ?run_for, "node running");
    thread::sleep(run_for);

    if !engine.is_healthy() {
        tracing::warn!(engine = %engine.owner(), "engine reported unhealthy");
    }
    let metrics = engine.metrics();
    let stats = engine.management().stats().context("reading job stats")?;
    engine.shutdown();

    let report = serde_json::json!({ "metrics": metrics, "jobs": stats });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
