//! Optimistic-lock revisions.

/// Optimistic concurrency expectation for a persisted record.
///
/// Every persisted mutation of a job increments its revision; a write carrying
/// a stale expectation must be refused by the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// Skip revision checking (operator overrides, cancellation).
    Any,
    /// Require the record to be at an exact revision.
    Exact(u64),
}

impl ExpectedRevision {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedRevision::Any => true,
            ExpectedRevision::Exact(v) => v == actual,
        }
    }
}

impl From<u64> for ExpectedRevision {
    fn from(value: u64) -> Self {
        ExpectedRevision::Exact(value)
    }
}
