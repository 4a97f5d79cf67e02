//! `jobforge-core`: primitives shared by the job execution subsystem.
//!
//! This crate contains **pure** building blocks (no storage, no threads).

pub mod clock;
pub mod error;
pub mod id;
pub mod revision;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{JobId, LockOwner, ScopeId};
pub use revision::ExpectedRevision;
