//! Asynchronous job execution.
//!
//! ## Flow
//!
//! ```text
//! JobStore ──poll──▶ AcquisitionCycle ──lock──▶ ExecutionPool ──▶ JobRunner
//!    ▲                      │ rejected: unlock                      │
//!    └──────────────────────┴──────── CommandExecutor ◀─────────────┘
//! ```
//!
//! - Jobs are persisted with a revision; every mutation is an optimistic write
//!   through the [`CommandExecutor`](crate::command_executor::CommandExecutor)
//! - Several engines may share one store; the store's lock rules are the only
//!   coordination between them
//! - Exclusive jobs of one scope never run concurrently
//! - Failed jobs are retried with backoff, then parked behind an incident
//!
//! ## Components
//!
//! - `Job`, `Incident`: persisted model
//! - `JobStore`: persistence boundary (in-memory implementation included)
//! - `HandlerRegistry`: job type → handler
//! - `AcquisitionCycle`: poll, lock, dispatch
//! - `ExecutionPool`: bounded queue + fixed workers
//! - `JobRunner`: handler transaction and outcome settlement
//! - `FailurePolicy`: retry decrement, backoff, incidents
//! - `BackpressureController`: batch size / poll interval control loop
//! - `JobEngine`: wires it all into one running instance
//! - `JobManagement`: schedule, cancel, retry, suspend

pub mod acquisition;
pub mod backpressure;
pub mod engine;
pub mod exclusivity;
pub mod handler;
pub mod incident;
pub mod management;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod runner;
pub mod store;
pub mod types;

pub use acquisition::{AcquisitionCycle, AcquisitionError, AcquisitionTrigger, CycleReport, CycleState};
pub use backpressure::{BackpressureConfig, BackpressureController};
pub use engine::{EngineError, EngineHealth, JobEngine, JobEngineHandle};
pub use exclusivity::{ScopeGuard, ScopeTokens};
pub use handler::{FnHandler, HandlerError, HandlerRegistry, JobHandler};
pub use incident::{InMemoryIncidentSink, IncidentSink, LogIncidentSink};
pub use management::JobManagement;
pub use metrics::{JobMetrics, MetricsSnapshot};
pub use pool::{DispatchedJob, ExecutionPool, JobDispatcher, PoolConfig};
pub use retry::{BackoffStrategy, FailurePolicy, RetryBackoff, RetryPolicy};
pub use runner::{Completion, ExecutionOutcome, JobRunner};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{Incident, Job, job_types};
