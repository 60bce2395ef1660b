//! Job handlers and the registry that resolves them.
//!
//! Jobs reference their handler by name only. The registry maps that name to an
//! implementation at execution time, so scheduling never depends on business logic.
//!
//! Cancellation is cooperative: the executor signals the [`JobContext`]'s token on
//! timeout or shutdown and expects the handler to return promptly. Nothing forcibly
//! terminates handler code beyond dropping its future.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{JobId, JobResult};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a handler for one execution attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    job_name: String,
    attempt: u32,
    scheduled_for: DateTime<Utc>,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        job_name: impl Into<String>,
        attempt: u32,
        scheduled_for: DateTime<Utc>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            job_name: job_name.into(),
            attempt,
            scheduled_for,
            cancellation,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The due time that triggered this execution cycle.
    pub fn scheduled_for(&self) -> DateTime<Utc> {
        self.scheduled_for
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Run `future` unless cancellation arrives first.
    pub async fn cancellable<F, T>(&self, future: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            result = future => Some(result),
            _ = self.cancellation.cancelled() => None,
        }
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job_id,
            job_name = %self.job_name,
            attempt = self.attempt,
            message
        );
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job_id,
            job_name = %self.job_name,
            attempt = self.attempt,
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The business logic behind a job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one attempt.
    ///
    /// Return [`JobError::fatal`](super::JobError::fatal) to skip the remaining retries.
    async fn execute(&self, ctx: &JobContext) -> JobResult;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn execute(&self, ctx: &JobContext) -> JobResult {
        (self.f)(ctx.clone()).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Name → handler mapping consulted by executors.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&self, name: impl Into<String>, handler: impl JobHandler + 'static) {
        self.register_arc(name, Arc::new(handler));
    }

    pub fn register_arc(&self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        tracing::debug!(handler = %name, "Registered job handler");
        self.handlers.insert(name, handler);
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.register(name, FnHandler::new(f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).map(|h| Arc::clone(h.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn ctx() -> JobContext {
        JobContext::new(JobId::new(), "test", 1, Utc::now(), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_register_and_resolve_closure() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        registry.register_fn("count", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let handler = registry.get("count").unwrap();
        handler.execute(&ctx()).await.unwrap();
        handler.execute(&ctx()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_handler_errors_pass_through() {
        let registry = HandlerRegistry::new();
        registry.register_fn("fail", |_ctx| async { Err(JobError::fatal("nope")) });

        let err = registry.get("fail").unwrap().execute(&ctx()).await.unwrap_err();
        assert!(!err.retryable);
        assert!(registry.unregister("fail"));
        assert!(!registry.contains("fail"));
    }

    #[tokio::test]
    async fn test_cancellable_stops_on_cancel() {
        let token = CancellationToken::new();
        let ctx = JobContext::new(JobId::new(), "slow", 1, Utc::now(), token.clone());
        token.cancel();

        let result = ctx.cancellable(tokio::time::sleep(Duration::from_secs(5))).await;
        assert!(result.is_none());
        assert!(ctx.is_cancelled());
    }
}
