//! Engine counters for the telemetry collector.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct JobMetrics {
    acquired: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    incidents: AtomicU64,
    contention: AtomicU64,
    store_errors: AtomicU64,
    cycles: AtomicU64,
}

/// Point-in-time copy of [`JobMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_acquired: u64,
    pub jobs_executed: u64,
    pub jobs_failed: u64,
    pub jobs_rejected: u64,
    pub incidents_created: u64,
    pub contention_events: u64,
    pub store_errors: u64,
    pub acquisition_cycles: u64,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_acquired(&self, n: u64) {
        self.acquired.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, n: u64) {
        self.rejected.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_incident(&self) {
        self.incidents.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_contention(&self) {
        self.contention.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_acquired: self.acquired.load(Ordering::Relaxed),
            jobs_executed: self.executed.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_rejected: self.rejected.load(Ordering::Relaxed),
            incidents_created: self.incidents.load(Ordering::Relaxed),
            contention_events: self.contention.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            acquisition_cycles: self.cycles.load(Ordering::Relaxed),
        }
    }
}
