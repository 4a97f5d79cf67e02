//! Per-scope execution tokens.
//!
//! An exclusive job takes its scope's token before it is dispatched and gives it
//! back when execution finishes (commit, contention or failure alike). Unrelated
//! scopes never wait on each other. Cross-engine exclusivity is the store's job;
//! these tokens keep a single engine from racing itself.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use jobforge_core::ScopeId;

#[derive(Debug, Clone, Default)]
pub struct ScopeTokens {
    held: Arc<Mutex<HashSet<ScopeId>>>,
}

impl ScopeTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the token for `scope`, or `None` if a job of that scope is in flight.
    pub fn try_acquire(&self, scope: &ScopeId) -> Option<ScopeGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(scope.clone()) {
            return None;
        }
        Some(ScopeGuard {
            scope: scope.clone(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, scope: &ScopeId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(scope)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Releases its scope token on drop.
#[derive(Debug)]
pub struct ScopeGuard {
    scope: ScopeId,
    held: Arc<Mutex<HashSet<ScopeId>>>,
}

impl ScopeGuard {
    pub fn scope(&self) -> &ScopeId {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.scope);
    }
}
