//! Job handler contract and the registry that resolves job types to handlers.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::command_executor::CommandContext;

use super::types::Job;

/// Business failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
    pub details: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self::new(format!("handler panicked: {reason}"))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Interprets jobs of one type.
///
/// Runs inside the executing transaction: anything the handler stages on the
/// context (new jobs, incidents) commits together with the job's completion,
/// and is discarded if the handler fails. Handlers must not block longer than
/// the transaction timeout; long external work is re-scheduled as a new job.
pub trait JobHandler: Send + Sync {
    fn handle(&self, job: &Job, ctx: &mut CommandContext<'_>) -> Result<(), HandlerError>;

    /// Retries left after a failed execution. Values are clamped so retries
    /// never grow through this hook.
    fn retries_after_failure(&self, job: &Job) -> u32 {
        job.retries_remaining.saturating_sub(1)
    }

    /// Overrides the configured backoff for the next attempt.
    fn retry_delay(&self, _job: &Job, _error: &HandlerError) -> Option<Duration> {
        None
    }
}

/// Adapter turning a closure into a [`JobHandler`].
pub struct FnHandler<F>(pub F);

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job, &mut CommandContext<'_>) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, job: &Job, ctx: &mut CommandContext<'_>) -> Result<(), HandlerError> {
        (self.0)(job, ctx)
    }
}

/// Maps job types to handlers.
///
/// Built once and handed to the engine at construction; there is no global
/// registration. Lookup order: exact type, longest `prefix.*` pattern, `*`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
        self
    }

    pub fn register_fn<F>(&mut self, pattern: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Job, &mut CommandContext<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register(pattern, FnHandler(handler))
    }

    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(job_type) {
            return Some(h.clone());
        }

        // Category match (e.g., "timer.*" matches "timer.cycle")
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                job_type
                    .strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, handler)) = category {
            return Some(handler.clone());
        }

        self.handlers.get("*").cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry").field("patterns", &patterns).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_executor::{CommandError, CommandExecutor};
    use crate::jobs::store::InMemoryJobStore;

    fn tagging(tag: &'static str) -> impl Fn(&Job, &mut CommandContext<'_>) -> Result<(), HandlerError> {
        move |_job: &Job, _ctx: &mut CommandContext<'_>| Err(HandlerError::new(tag))
    }

    fn which(registry: &HandlerRegistry, job_type: &str) -> Option<String> {
        let handler = registry.resolve(job_type)?;
        let executor = CommandExecutor::new(InMemoryJobStore::arc());
        let job = Job::new(job_type);
        let err = executor
            .execute(("probe", |ctx: &mut CommandContext<'_>| -> Result<(), CommandError> {
                handler.handle(&job, ctx).map_err(CommandError::from)
            }))
            .unwrap_err();
        match err {
            CommandError::CommandFailure(e) => Some(e.message),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn exact_match_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("timer.cycle", tagging("exact"));
        registry.register_fn("timer.*", tagging("category"));
        registry.register_fn("*", tagging("wildcard"));

        assert_eq!(which(&registry, "timer.cycle").as_deref(), Some("exact"));
        assert_eq!(which(&registry, "timer.date").as_deref(), Some("category"));
        assert_eq!(which(&registry, "batch-step").as_deref(), Some("wildcard"));
    }

    #[test]
    fn longest_category_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("batch.*", tagging("batch"));
        registry.register_fn("batch.seed.*", tagging("seed"));

        assert_eq!(which(&registry, "batch.seed.monitor").as_deref(), Some("seed"));
        assert_eq!(which(&registry, "batch.step").as_deref(), Some("batch"));
        assert!(registry.resolve("batchx").is_none());
    }

    #[test]
    fn unknown_type_without_fallback_is_unresolved() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("timer-fire", tagging("timer"));
        assert!(registry.resolve("async-continuation").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn default_retry_decrement_is_one() {
        let handler = FnHandler(tagging("x"));
        let job = Job::new("t").with_retries(3);
        assert_eq!(handler.retries_after_failure(&job), 2);
        assert_eq!(handler.retries_after_failure(&Job::new("t").with_retries(0)), 0);
    }

    #[test]
    fn panic_payloads_are_readable() {
        let from_str = HandlerError::from_panic(Box::new("boom"));
        assert_eq!(from_str.message, "handler panicked: boom");
        let from_string = HandlerError::from_panic(Box::new(String::from("bang")));
        assert_eq!(from_string.message, "handler panicked: bang");
    }
}
