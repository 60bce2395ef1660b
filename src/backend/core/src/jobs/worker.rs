//! Worker pool: bounded concurrent execution of dispatched jobs.
//!
//! Each of the `pool_size` executors pulls the next item from the dispatch queue and
//! runs one *execution cycle* attempt:
//!
//! 1. take the per-job lease (retries carry theirs; a held lease drops the item)
//! 2. mark the job `running` (first attempt only)
//! 3. resolve the handler and run it under the job's timeout
//! 4. append exactly one [`ExecutionRecord`] to history
//! 5. either schedule a retry, carrying the lease, or finalize the job's status and
//!    release the lease
//!
//! A retry waits for its backoff delay in a separate task and is then re-queued, so an
//! executor is never blocked by a backoff.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::history::HistoryStore;
use super::lease::{JobLease, LeaseTable};
use super::queue::{DeadLetterEntry, DeadLetterQueue, DispatchItem, DispatchQueue};
use super::retry::RetryPolicy;
use super::store::{JobStore, StatusChange};
use super::{
    ExecutionOutcome, ExecutionRecord, HandlerRegistry, Job, JobContext, JobId, JobPriority, JobStatus,
    ScheduleKind,
};
use crate::error::{ErrorCode, TempoError};

/// Bounded retries of a version-checked status write before giving up.
const MAX_STATUS_WRITE_ATTEMPTS: usize = 5;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration & Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrent executions
    pub pool_size: usize,
    /// Time executors get to wind down on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Pool name for logs
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            shutdown_grace: Duration::from_secs(30),
            name: "tempo-worker".to_string(),
        }
    }
}

/// Counters shared by every executor of a pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Attempts executed
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    pub timed_out: Arc<AtomicU64>,
    pub cancelled: Arc<AtomicU64>,
    pub retries_scheduled: Arc<AtomicU64>,
    /// Items dropped because the job's lease was already held
    pub dropped_by_lease: Arc<AtomicU64>,
    /// Currently running attempts
    pub active: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled.load(Ordering::Relaxed)
    }

    pub fn dropped_by_lease(&self) -> u64 {
        self.dropped_by_lease.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    fn record_outcome(&self, outcome: ExecutionOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            ExecutionOutcome::Success => &self.succeeded,
            ExecutionOutcome::Failure => &self.failed,
            ExecutionOutcome::Timeout => &self.timed_out,
            ExecutionOutcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Executor
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything an executor needs, shared by all executors of a pool.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    history: Arc<dyn HistoryStore>,
    handlers: HandlerRegistry,
    queue: Arc<DispatchQueue>,
    leases: Arc<LeaseTable>,
    retry_policy: RetryPolicy,
    dead_letters: Arc<DeadLetterQueue>,
    stats: WorkerStats,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
    retry_tasks: TaskTracker,
}

/// Result of one attempt, before retry policy is applied.
struct AttemptResult {
    record: ExecutionRecord,
    retryable: bool,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        history: Arc<dyn HistoryStore>,
        handlers: HandlerRegistry,
        queue: Arc<DispatchQueue>,
        leases: Arc<LeaseTable>,
        retry_policy: RetryPolicy,
        dead_letters: Arc<DeadLetterQueue>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            history,
            handlers,
            queue,
            leases,
            retry_policy,
            dead_letters,
            stats: WorkerStats::new(),
            shutdown,
            shutdown_grace: WorkerConfig::default().shutdown_grace,
            retry_tasks: TaskTracker::new(),
        }
    }

    /// How long an interrupted handler may keep running after shutdown is signalled.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Process one dispatched item to the end of its attempt.
    pub async fn process(self: &Arc<Self>, item: DispatchItem) {
        let DispatchItem {
            job_id,
            priority,
            due_at,
            attempt,
            lease,
        } = item;

        let Some(lease) = lease.or_else(|| self.leases.try_acquire(job_id)) else {
            self.stats.dropped_by_lease.fetch_add(1, Ordering::Relaxed);
            counter!("tempo_dispatch_skipped_total", "reason" => "lease_held").increment(1);
            tracing::debug!(job_id = %job_id, "Dropping dispatch, job is already executing");
            return;
        };

        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(e) if e.is(ErrorCode::JobNotFound) => {
                tracing::debug!(job_id = %job_id, "Job deleted before execution");
                self.purge_history(job_id).await;
                return;
            }
            Err(e) => {
                e.log();
                return;
            }
        };

        let job = if attempt == 1 {
            match self.begin_cycle(job).await {
                Some(job) => job,
                None => return,
            }
        } else {
            job
        };

        let result = self.run_attempt(&job, attempt, due_at).await;
        let outcome = result.record.outcome;
        let finished_at = result.record.finished_at;
        let detail = result.record.error_detail.clone();

        if let Err(e) = self.history.append(result.record).await {
            e.log();
        }

        if outcome == ExecutionOutcome::Success {
            self.finish_cycle(job_id, finished_at).await;
            drop(lease);
            return;
        }

        if result.retryable && !self.shutdown.is_cancelled() {
            if let Some(delay) = self.retry_policy.next_retry_delay(attempt, job.max_retries) {
                self.schedule_retry(job_id, priority, attempt + 1, delay, lease);
                return;
            }
        }

        if matches!(outcome, ExecutionOutcome::Failure | ExecutionOutcome::Timeout) {
            self.dead_letter(&job, attempt, outcome, detail);
        }
        self.finish_cycle(job_id, finished_at).await;
        drop(lease);
    }

    /// Mark a scheduled job running. `None` if it should not run after all.
    async fn begin_cycle(&self, mut job: Job) -> Option<Job> {
        for _ in 0..MAX_STATUS_WRITE_ATTEMPTS {
            if job.status != JobStatus::Scheduled {
                tracing::debug!(
                    job_id = %job.id,
                    status = %job.status,
                    "Skipping dispatch, job is no longer scheduled"
                );
                return None;
            }

            let change = StatusChange::new(JobStatus::Running, job.next_run_at);
            match self.store.update_status(job.id, job.version, change).await {
                Ok(running) => return Some(running),
                Err(e) if e.is(ErrorCode::ConcurrentModification) => {
                    job = self.store.get(job.id).await.ok()?;
                }
                Err(e) => {
                    e.log();
                    return None;
                }
            }
        }
        tracing::warn!(job_id = %job.id, "Could not mark job running, skipping dispatch");
        None
    }

    async fn run_attempt(&self, job: &Job, attempt: u32, due_at: DateTime<Utc>) -> AttemptResult {
        let started_at = Utc::now();
        let active = self.stats.active.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("tempo_active_executions").set(active as f64);

        let (outcome, detail, retryable) = match self.handlers.get(&job.handler) {
            None => (
                ExecutionOutcome::Failure,
                Some(TempoError::handler_not_found(&job.handler).user_message().to_string()),
                false,
            ),
            Some(handler) => {
                let token = self.shutdown.child_token();
                let ctx = JobContext::new(job.id, job.name.clone(), attempt, due_at, token.clone());
                let run = tokio::time::timeout(
                    job.timeout,
                    AssertUnwindSafe(handler.execute(&ctx)).catch_unwind(),
                );
                tokio::pin!(run);

                let finished = tokio::select! {
                    result = &mut run => Some(result),
                    _ = self.shutdown.cancelled() => {
                        tokio::time::timeout(self.shutdown_grace, &mut run).await.ok()
                    }
                };
                token.cancel();

                let interrupted = self.shutdown.is_cancelled();
                match finished {
                    Some(Ok(Ok(Ok(())))) => (ExecutionOutcome::Success, None, false),
                    None => (
                        ExecutionOutcome::Cancelled,
                        Some("interrupted by scheduler shutdown".to_string()),
                        false,
                    ),
                    Some(Ok(Ok(Err(error)))) if interrupted => (
                        ExecutionOutcome::Cancelled,
                        Some(format!("interrupted by scheduler shutdown: {}", error)),
                        false,
                    ),
                    Some(Ok(Ok(Err(error)))) => (ExecutionOutcome::Failure, Some(error.to_string()), error.retryable),
                    Some(Ok(Err(_panic))) => (
                        ExecutionOutcome::Failure,
                        Some("handler panicked".to_string()),
                        true,
                    ),
                    Some(Err(_elapsed)) => (
                        ExecutionOutcome::Timeout,
                        Some(format!("execution exceeded timeout of {:?}", job.timeout)),
                        true,
                    ),
                }
            }
        };

        let finished_at = Utc::now().max(started_at);
        let active = self.stats.active.fetch_sub(1, Ordering::Relaxed) - 1;
        gauge!("tempo_active_executions").set(active as f64);

        self.stats.record_outcome(outcome);
        counter!("tempo_executions_total", "outcome" => outcome.as_str()).increment(1);
        let elapsed = (finished_at - started_at).to_std().unwrap_or_default();
        histogram!("tempo_execution_duration_seconds").record(elapsed.as_secs_f64());

        let record = match detail {
            None => ExecutionRecord::success(job.id, attempt, started_at, finished_at),
            Some(detail) => {
                tracing::warn!(
                    job_id = %job.id,
                    job_name = %job.name,
                    attempt,
                    outcome = %outcome,
                    error = %detail,
                    "Job execution did not succeed"
                );
                ExecutionRecord::unsuccessful(job.id, attempt, started_at, finished_at, outcome, detail)
            }
        };

        if outcome == ExecutionOutcome::Success {
            tracing::debug!(
                job_id = %job.id,
                job_name = %job.name,
                attempt,
                duration_ms = elapsed.as_millis() as u64,
                "Job execution succeeded"
            );
        }

        AttemptResult { record, retryable }
    }

    /// Wait out the backoff in the background, then re-queue the same cycle.
    fn schedule_retry(
        self: &Arc<Self>,
        job_id: JobId,
        priority: JobPriority,
        attempt: u32,
        delay: Duration,
        lease: JobLease,
    ) {
        self.stats.retries_scheduled.fetch_add(1, Ordering::Relaxed);
        counter!("tempo_retries_total").increment(1);
        tracing::info!(
            job_id = %job_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );

        let this = Arc::clone(self);
        self.retry_tasks.spawn(async move {
            let elapsed = tokio::select! {
                _ = tokio::time::sleep(delay) => true,
                _ = this.shutdown.cancelled() => false,
            };

            if elapsed && !this.queue.is_closed() {
                if this.queue.push(DispatchItem::retry(job_id, priority, attempt, lease)) {
                    return;
                }
                // Closed in the meantime; the rejected item released the lease.
                this.finish_cycle(job_id, Utc::now()).await;
                return;
            }

            this.finish_cycle(job_id, Utc::now()).await;
            drop(lease);
        });
    }

    fn dead_letter(&self, job: &Job, attempts: u32, outcome: ExecutionOutcome, error_detail: Option<String>) {
        let id = Uuid::new_v4();
        counter!("tempo_dead_letters_total").increment(1);
        tracing::warn!(
            dead_letter_id = %id,
            job_id = %job.id,
            job_name = %job.name,
            attempts,
            "Execution failed terminally, moved to dead letter queue"
        );
        self.dead_letters.push(DeadLetterEntry {
            id,
            job_id: job.id,
            job_name: job.name.clone(),
            handler: job.handler.clone(),
            attempts,
            outcome,
            error_detail,
            moved_at: Utc::now(),
        });
    }

    /// Apply the end of an execution cycle to the job's status.
    pub async fn finish_cycle(&self, job_id: JobId, finished_at: DateTime<Utc>) {
        for _ in 0..MAX_STATUS_WRITE_ATTEMPTS {
            let job = match self.store.get(job_id).await {
                Ok(job) => job,
                Err(e) if e.is(ErrorCode::JobNotFound) => {
                    self.purge_history(job_id).await;
                    return;
                }
                Err(e) => {
                    e.log();
                    return;
                }
            };

            let Some(change) = completion_change(&job, finished_at) else {
                return;
            };

            match self.store.update_status(job.id, job.version, change).await {
                Ok(updated) => {
                    tracing::debug!(
                        job_id = %job_id,
                        status = %updated.status,
                        next_run_at = ?updated.next_run_at,
                        "Execution cycle finished"
                    );
                    return;
                }
                Err(e) if e.is(ErrorCode::ConcurrentModification) => continue,
                Err(e) if e.is(ErrorCode::JobNotFound) => {
                    self.purge_history(job_id).await;
                    return;
                }
                Err(e) => {
                    e.log();
                    return;
                }
            }
        }
        tracing::warn!(job_id = %job_id, "Gave up finalizing job status after repeated conflicts");
    }

    /// History written by a cycle that outlived its job.
    async fn purge_history(&self, job_id: JobId) {
        if let Err(e) = self.history.purge(job_id).await {
            e.log();
        }
    }

    async fn run_loop(self: Arc<Self>, pool_name: String, executor_id: usize) {
        tracing::debug!(pool_name = %pool_name, executor_id, "Executor started");
        loop {
            let item = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                item = self.queue.pop() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.process(item).await;
        }
        tracing::debug!(pool_name = %pool_name, executor_id, "Executor stopped");
    }
}

/// Status to write when a cycle ends, or `None` if the job is not running.
fn completion_change(job: &Job, finished_at: DateTime<Utc>) -> Option<StatusChange> {
    if job.status != JobStatus::Running {
        return None;
    }

    let once = job.kind() == ScheduleKind::Once;
    let change = match job.requested_status {
        Some(JobStatus::Cancelled) => StatusChange::new(JobStatus::Cancelled, None),
        _ if once => StatusChange::new(JobStatus::Completed, None),
        Some(JobStatus::Paused) => StatusChange::new(JobStatus::Paused, job.next_run_at),
        _ => match job
            .schedule
            .next_run_after_completion(&job.timezone, job.next_run_at, finished_at)
        {
            Ok(next) => StatusChange::new(JobStatus::Scheduled, next),
            Err(e) => {
                tracing::error!(
                    job_id = %job.id,
                    error = %e,
                    "Cannot compute next run, pausing job"
                );
                StatusChange::new(JobStatus::Paused, None)
            }
        },
    };
    Some(change)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worker Pool
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed-size set of executors draining the dispatch queue.
pub struct WorkerPool {
    config: WorkerConfig,
    executor: Arc<JobExecutor>,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig, executor: Arc<JobExecutor>) -> Self {
        Self { config, executor }
    }

    /// Spawn the executors, returning a handle for control.
    pub fn start(self) -> WorkerHandle {
        let pool_size = self.config.pool_size.max(1);
        let tasks: Vec<JoinHandle<()>> = (0..pool_size)
            .map(|executor_id| {
                let executor = Arc::clone(&self.executor);
                tokio::spawn(executor.run_loop(self.config.name.clone(), executor_id))
            })
            .collect();

        tracing::info!(
            pool_name = %self.config.name,
            pool_size,
            "Worker pool started"
        );

        WorkerHandle {
            config: self.config,
            executor: self.executor,
            tasks,
        }
    }
}

/// Handle for controlling a running worker pool.
pub struct WorkerHandle {
    config: WorkerConfig,
    executor: Arc<JobExecutor>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        self.executor.stats()
    }

    /// Stop the pool: signal cancellation, close the queue and wait for executors.
    ///
    /// Returns `false` if executors were still busy after the grace period.
    pub async fn shutdown(self) -> bool {
        let WorkerHandle {
            config,
            executor,
            tasks,
        } = self;

        executor.shutdown.cancel();
        for item in executor.queue.close() {
            // Queued retries hold a running cycle; close it out.
            if item.is_retry() {
                executor.finish_cycle(item.job_id, Utc::now()).await;
            }
        }
        executor.retry_tasks.close();

        let drained = async {
            futures::future::join_all(tasks).await;
            executor.retry_tasks.wait().await;
        };
        // Executors get the handler grace plus a little slack to write their records.
        let budget = config.shutdown_grace + Duration::from_secs(1);
        let clean = tokio::time::timeout(budget, drained).await.is_ok();

        if clean {
            tracing::info!(pool_name = %config.name, "Worker pool stopped");
        } else {
            tracing::warn!(
                pool_name = %config.name,
                grace_ms = config.shutdown_grace.as_millis() as u64,
                "Worker pool did not stop within the grace period"
            );
        }
        clean
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
