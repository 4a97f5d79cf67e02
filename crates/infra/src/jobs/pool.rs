//! Bounded execution pool.
//!
//! A fixed set of worker threads reads from one bounded queue. Submissions never
//! block: a full queue hands the job straight back to the caller, which is the
//! acquisition cycle's backpressure signal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{debug, info};

use super::exclusivity::ScopeGuard;
use super::types::Job;

/// A locked job on its way to a worker, with its scope token if exclusive.
#[derive(Debug)]
pub struct DispatchedJob {
    pub job: Job,
    pub scope_guard: Option<ScopeGuard>,
}

impl DispatchedJob {
    pub fn new(job: Job, scope_guard: Option<ScopeGuard>) -> Self {
        Self { job, scope_guard }
    }
}

/// Where the acquisition cycle hands locked jobs.
pub trait JobDispatcher: Send + Sync {
    /// Returns the job back when it cannot be taken right now.
    fn dispatch(&self, job: DispatchedJob) -> Result<(), DispatchedJob>;

    /// Busy workers plus queued jobs over pool size, capped at 1.0.
    fn utilization(&self) -> f64;
}

/// Work performed by pool threads.
pub trait JobWorker: Send + Sync + 'static {
    fn run(&self, job: DispatchedJob);
}

impl<F> JobWorker for F
where
    F: Fn(DispatchedJob) + Send + Sync + 'static,
{
    fn run(&self, job: DispatchedJob) {
        self(job)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    /// Jobs waiting beyond the busy workers; 0 hands off only to idle workers
    pub queue_capacity: usize,
}

/// Fixed worker pool behind a bounded queue.
#[derive(Debug)]
pub struct ExecutionPool {
    name: String,
    sender: Option<SyncSender<DispatchedJob>>,
    workers: Vec<thread::JoinHandle<()>>,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
    size: usize,
}

impl ExecutionPool {
    pub fn start<W>(name: impl Into<String>, config: PoolConfig, worker: Arc<W>) -> std::io::Result<Self>
    where
        W: JobWorker,
    {
        let name = name.into();
        let size = config.workers.max(1);
        let (tx, rx) = mpsc::sync_channel::<DispatchedJob>(config.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let active = Arc::new(AtomicUsize::new(0));
        let queued = Arc::new(AtomicUsize::new(0));

        let mut pool = Self {
            name: name.clone(),
            sender: Some(tx),
            workers: Vec::with_capacity(size),
            active: active.clone(),
            queued: queued.clone(),
            size,
        };

        for i in 0..size {
            let rx = rx.clone();
            let worker = worker.clone();
            let active = active.clone();
            let queued = queued.clone();
            let thread_name = format!("{name}-worker-{i}");
            let join = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(&thread_name, &rx, worker.as_ref(), &active, &queued));
            match join {
                Ok(join) => pool.workers.push(join),
                Err(e) => {
                    pool.shutdown();
                    return Err(e);
                }
            }
        }

        info!(pool = %name, workers = size, queue = config.queue_capacity, "execution pool started");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Submitted jobs not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.active() == 0 && self.queued() == 0
    }

    /// Non-blocking submit. A full queue (or a stopped pool) returns the job.
    pub fn try_submit(&self, job: DispatchedJob) -> Result<(), DispatchedJob> {
        let Some(sender) = &self.sender else {
            return Err(job);
        };
        self.queued.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                Err(job)
            }
        }
    }

    /// Stop accepting work, let workers drain the queue, and join them.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for join in self.workers.drain(..) {
            let _ = join.join();
        }
        debug!(pool = %self.name, "execution pool stopped");
    }
}

impl JobDispatcher for ExecutionPool {
    fn dispatch(&self, job: DispatchedJob) -> Result<(), DispatchedJob> {
        self.try_submit(job)
    }

    fn utilization(&self) -> f64 {
        ((self.active() + self.queued()) as f64 / self.size as f64).min(1.0)
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        if self.sender.is_some() || !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

fn worker_loop(
    name: &str,
    rx: &Mutex<Receiver<DispatchedJob>>,
    worker: &dyn JobWorker,
    active: &AtomicUsize,
    queued: &AtomicUsize,
) {
    loop {
        let next = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        let Ok(job) = next else {
            break;
        };

        active.fetch_add(1, Ordering::AcqRel);
        queued.fetch_sub(1, Ordering::AcqRel);
        worker.run(job);
        active.fetch_sub(1, Ordering::AcqRel);
    }
    debug!(worker = name, "pool worker exiting");
}
