//! Engine instance: one acquisition thread feeding a bounded worker pool.
//!
//! Several engines may share one store; they coordinate only through the
//! store's optimistic locking.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use jobforge_core::{Clock, LockOwner, SystemClock};

use crate::command_executor::CommandExecutor;
use crate::config::{ConfigError, EngineConfig};

use super::acquisition::{AcquisitionCycle, AcquisitionTrigger, CycleReport, IdleBackoff};
use super::backpressure::{BackpressureController, PressureSample};
use super::exclusivity::ScopeTokens;
use super::handler::HandlerRegistry;
use super::incident::{IncidentSink, LogIncidentSink};
use super::management::JobManagement;
use super::metrics::{JobMetrics, MetricsSnapshot};
use super::pool::{ExecutionPool, JobDispatcher, PoolConfig};
use super::retry::{FailurePolicy, RetryBackoff};
use super::runner::JobRunner;
use super::store::JobStore;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Liveness as seen by the hosting process.
///
/// Turns unhealthy after `threshold` consecutive failed acquisition cycles and
/// recovers on the next good one.
#[derive(Debug)]
pub struct EngineHealth {
    running: AtomicBool,
    consecutive_failures: AtomicU32,
    threshold: u32,
}

impl EngineHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            running: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.consecutive_failures.load(Ordering::Acquire) < self.threshold
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Returns the new failure streak.
    fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Builder for an engine instance.
pub struct JobEngine<S> {
    store: S,
    registry: HandlerRegistry,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    incident_sink: Arc<dyn IncidentSink>,
    backoff: Option<Arc<dyn RetryBackoff>>,
}

impl<S> JobEngine<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: S, registry: HandlerRegistry, config: EngineConfig) -> Self {
        Self {
            store,
            registry,
            config,
            clock: Arc::new(SystemClock),
            incident_sink: Arc::new(LogIncidentSink),
            backoff: None,
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

    /// Replace the configured retry policy with a custom strategy.
    pub fn with_backoff(mut self, backoff: Arc<dyn RetryBackoff>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Validate the config, start the pool and the acquisition thread.
    pub fn spawn(self) -> Result<JobEngineHandle<S>, EngineError> {
        let JobEngine {
            store,
            registry,
            config,
            clock,
            incident_sink,
            backoff,
        } = self;
        config.validate()?;

        let executor = Arc::new(
            CommandExecutor::new(store)
                .with_clock(clock)
                .with_incident_sink(incident_sink)
                .with_transaction_timeout(config.transaction_timeout),
        );
        let owner = LockOwner::generate(&config.engine_name);
        let metrics = Arc::new(JobMetrics::new());
        let health = Arc::new(EngineHealth::new(config.store_failure_threshold));
        let (trigger, trigger_rx) = AcquisitionTrigger::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let backoff = backoff.unwrap_or_else(|| Arc::new(config.retry_policy.clone()));
        let runner = JobRunner::new(
            executor.clone(),
            Arc::new(registry),
            FailurePolicy::new(backoff),
            owner.clone(),
            metrics.clone(),
        )
        .with_trigger(trigger.clone());

        let pool = ExecutionPool::start(
            config.engine_name.clone(),
            PoolConfig {
                workers: config.max_pool_size,
                queue_capacity: config.queue_capacity,
            },
            Arc::new(runner),
        )?;

        let cycle = AcquisitionCycle::new(
            executor.clone(),
            owner.clone(),
            config.lock_duration,
            ScopeTokens::new(),
            metrics.clone(),
        );

        health.set_running(true);
        let loop_health = health.clone();
        let loop_config = config.clone();
        let join = thread::Builder::new()
            .name(format!("{}-acquisition", config.engine_name))
            .spawn(move || {
                acquisition_loop(cycle, pool, loop_config, shutdown_rx, trigger_rx, &loop_health);
                loop_health.set_running(false);
            })
            .inspect_err(|_| health.set_running(false))?;

        info!(engine = %owner, workers = config.max_pool_size, batch = config.batch_size, "job engine started");

        let management = JobManagement::new(executor.clone(), config.default_retries).with_trigger(trigger.clone());
        Ok(JobEngineHandle {
            owner,
            shutdown: shutdown_tx,
            trigger,
            join: Some(join),
            metrics,
            health,
            executor,
            management,
        })
    }
}

/// Handle to control a running engine.
pub struct JobEngineHandle<S> {
    owner: LockOwner,
    shutdown: mpsc::Sender<()>,
    trigger: AcquisitionTrigger,
    join: Option<thread::JoinHandle<()>>,
    metrics: Arc<JobMetrics>,
    health: Arc<EngineHealth>,
    executor: Arc<CommandExecutor<S>>,
    management: JobManagement<S>,
}

impl<S> JobEngineHandle<S>
where
    S: JobStore,
{
    /// Lock owner id of this engine.
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Wake acquisition now instead of waiting out the current backoff.
    pub fn trigger(&self) {
        self.trigger.fire();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn health(&self) -> &EngineHealth {
        &self.health
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn executor(&self) -> &Arc<CommandExecutor<S>> {
        &self.executor
    }

    pub fn management(&self) -> &JobManagement<S> {
        &self.management
    }

    /// Stop acquiring, let in-flight and queued jobs finish, join all threads.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        self.trigger.fire();
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
        info!(engine = %self.owner, "job engine stopped");
    }
}

fn acquisition_loop<S>(
    mut cycle: AcquisitionCycle<S>,
    mut pool: ExecutionPool,
    config: EngineConfig,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: Receiver<()>,
    health: &EngineHealth,
) where
    S: JobStore,
{
    let engine = cycle.owner().clone();
    info!(engine = %engine, "acquisition started");

    let mut idle = IdleBackoff::new(config.poll_interval, config.max_idle_wait);
    let mut backpressure =
        BackpressureController::new(config.backpressure.clone(), config.batch_size, config.poll_interval);

    loop {
        // Shutdown has priority.
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let wait = match cycle.acquire(backpressure.batch_size(), &pool) {
            Ok(report) => {
                health.record_success();
                backpressure.observe(PressureSample {
                    utilization: pool.utilization(),
                    rejected: report.rejected,
                    at: Instant::now(),
                });

                wait_after(&report, &mut idle, &backpressure)
            }
            Err(e) => {
                let streak = health.record_failure();
                if streak == config.store_failure_threshold {
                    warn!(engine = %engine, failures = streak, error = %e, "engine unhealthy: job store keeps failing");
                }
                idle.next_wait()
            }
        };

        if wait.is_zero() {
            continue;
        }
        match trigger_rx.recv_timeout(wait) {
            Ok(()) => {
                // Coalesce any further pending wake-ups.
                while trigger_rx.try_recv().is_ok() {}
                idle.reset();
                debug!(engine = %engine, "acquisition woken early");
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                error!(engine = %engine, "acquisition trigger channel closed");
                thread::sleep(wait);
            }
        }
    }

    pool.shutdown();
    info!(engine = %engine, "acquisition stopped");
}

/// Pause before the next cycle. Only a full batch that dispatched work polls
/// again immediately.
fn wait_after(report: &CycleReport, idle: &mut IdleBackoff, backpressure: &BackpressureController) -> Duration {
    if report.found_nothing() || report.rejected > 0 {
        return idle.next_wait().max(backpressure.poll_interval());
    }
    idle.reset();
    if report.dispatched > 0 && report.polled >= backpressure.batch_size() && !backpressure.is_throttled() {
        Duration::ZERO
    } else {
        backpressure.poll_interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_executor::CommandContext;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::Job;

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn quick_config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(10),
            max_idle_wait: Duration::from_millis(50),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn runs_scheduled_jobs_and_shuts_down() {
        let store = InMemoryJobStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("t", |_job: &Job, _ctx: &mut CommandContext<'_>| Ok(()));

        let engine = JobEngine::new(store.clone(), registry, quick_config()).spawn().unwrap();
        for _ in 0..5 {
            engine.management().schedule(Job::new("t")).unwrap();
        }

        wait_until(|| engine.metrics().jobs_executed == 5);
        assert!(engine.is_healthy());
        assert!(store.all_jobs().unwrap().is_empty());

        engine.shutdown();
    }

    #[test]
    fn store_outage_flips_health_and_recovers() {
        let store = InMemoryJobStore::arc();
        let config = EngineConfig {
            store_failure_threshold: 2,
            max_idle_wait: Duration::from_millis(20),
            ..quick_config()
        };
        let engine = JobEngine::new(store.clone(), HandlerRegistry::new(), config).spawn().unwrap();

        store.set_available(false);
        wait_until(|| !engine.is_healthy());
        assert!(engine.health().is_running());

        store.set_available(true);
        wait_until(|| engine.is_healthy());

        engine.shutdown();
    }

    fn controller() -> BackpressureController {
        BackpressureController::new(Default::default(), 4, Duration::from_millis(100))
    }

    #[test]
    fn full_dispatched_batch_polls_again_at_once() {
        let mut idle = IdleBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        let report = CycleReport {
            polled: 4,
            dispatched: 4,
            ..CycleReport::default()
        };
        assert_eq!(wait_after(&report, &mut idle, &controller()), Duration::ZERO);
    }

    #[test]
    fn full_batch_without_dispatch_waits() {
        let mut idle = IdleBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        let report = CycleReport {
            polled: 4,
            deferred: 3,
            lost_races: 1,
            ..CycleReport::default()
        };
        assert_eq!(wait_after(&report, &mut idle, &controller()), Duration::from_millis(100));
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        let err = JobEngine::new(InMemoryJobStore::arc(), HandlerRegistry::new(), config)
            .spawn()
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
