//! Job manager: the facade over stores, scheduler loop and worker pool.
//!
//! Structural errors (`InvalidScheduleSpec`, `JobNotFound`, `ConcurrentModification`,
//! `InvalidStateTransition`) are returned to the caller. Execution-time failures never
//! are; they end up in history and the dead-letter queue.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cron::parse_timezone;
use super::history::{HistoryStore, InMemoryHistoryStore};
use super::lease::LeaseTable;
use super::queue::{DeadLetterEntry, DeadLetterQueue, DispatchItem, DispatchQueue};
use super::scheduler::{SchedulerLoop, TickReport};
use super::store::{InMemoryJobStore, JobFilter, JobStore, JobUpdate, StatusChange};
use super::worker::{JobExecutor, WorkerHandle, WorkerPool};
use super::{ExecutionRecord, HandlerRegistry, Job, JobId, JobOptions, JobStatus, NewJob, ScheduleSpec};
use crate::config::SchedulerConfig;
use crate::error::{ErrorCode, ErrorContext, Result, TempoError};

/// Attempts for read-modify-write cycles racing the scheduler or executors.
const MAX_WRITE_ATTEMPTS: usize = 3;

// ═══════════════════════════════════════════════════════════════════════════════
// Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time view of the scheduling core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub queue_depth: usize,
    pub active_executions: u64,
    pub executions_processed: u64,
    pub executions_succeeded: u64,
    pub executions_failed: u64,
    pub executions_timed_out: u64,
    pub executions_cancelled: u64,
    pub retries_scheduled: u64,
    pub dispatches_dropped_by_lease: u64,
    pub dead_letters: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builder for [`JobManager`]. Stores default to the in-memory implementations.
#[derive(Default)]
pub struct JobManagerBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn JobStore>>,
    history: Option<Arc<dyn HistoryStore>>,
    handlers: Option<HandlerRegistry>,
}

impl JobManagerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Validate the configuration and wire the components together.
    pub fn build(self) -> Result<JobManager> {
        self.config.validate()?;
        let default_timezone = self.config.timezone()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));
        let history = self.history.unwrap_or_else(|| {
            Arc::new(InMemoryHistoryStore::new(self.config.history_retention_per_job))
        });
        let handlers = self.handlers.unwrap_or_default();

        let queue = Arc::new(DispatchQueue::new());
        let leases = LeaseTable::new();
        let dead_letters = Arc::new(DeadLetterQueue::new(self.config.dead_letter_capacity));
        let shutdown = CancellationToken::new();

        let executor = Arc::new(
            JobExecutor::new(
                Arc::clone(&store),
                Arc::clone(&history),
                handlers.clone(),
                Arc::clone(&queue),
                Arc::clone(&leases),
                self.config.retry_policy(),
                Arc::clone(&dead_letters),
                shutdown.clone(),
            )
            .with_shutdown_grace(self.config.shutdown_grace),
        );

        let scheduler = Arc::new(SchedulerLoop::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            leases,
            self.config.poll_interval,
            shutdown.clone(),
        ));

        Ok(JobManager {
            config: self.config,
            default_timezone,
            store,
            history,
            handlers,
            queue,
            dead_letters,
            executor,
            scheduler,
            shutdown,
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Manager
// ═══════════════════════════════════════════════════════════════════════════════

enum Lifecycle {
    Idle,
    Running {
        scheduler: JoinHandle<()>,
        workers: WorkerHandle,
    },
    Stopped,
}

/// Entry point for scheduling and controlling jobs.
pub struct JobManager {
    config: SchedulerConfig,
    default_timezone: Tz,
    store: Arc<dyn JobStore>,
    history: Arc<dyn HistoryStore>,
    handlers: HandlerRegistry,
    queue: Arc<DispatchQueue>,
    dead_letters: Arc<DeadLetterQueue>,
    executor: Arc<JobExecutor>,
    scheduler: Arc<SchedulerLoop>,
    shutdown: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl JobManager {
    pub fn builder() -> JobManagerBuilder {
        JobManagerBuilder::default()
    }

    /// Manager with in-memory stores.
    pub fn new(config: SchedulerConfig, handlers: HandlerRegistry) -> Result<Self> {
        Self::builder().config(config).handlers(handlers).build()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    // ─── Scheduling ────────────────────────────────────────────────────────────

    /// Schedule a recurring cron job. `timezone` defaults to the configured zone.
    pub async fn schedule_cron(
        &self,
        name: impl Into<String>,
        expression: &str,
        timezone: Option<&str>,
        options: JobOptions,
        handler: impl Into<String>,
    ) -> Result<Job> {
        let timezone = match timezone {
            Some(name) => parse_timezone(name)?,
            None => self.default_timezone,
        };
        self.schedule(NewJob {
            name: name.into(),
            schedule: ScheduleSpec::cron(expression),
            timezone,
            options,
            handler: handler.into(),
        })
        .await
    }

    /// Schedule a single execution at `at`, which must lie in the future.
    pub async fn schedule_once(
        &self,
        name: impl Into<String>,
        at: DateTime<Utc>,
        options: JobOptions,
        handler: impl Into<String>,
    ) -> Result<Job> {
        self.schedule(NewJob {
            name: name.into(),
            schedule: ScheduleSpec::once(at),
            timezone: self.default_timezone,
            options,
            handler: handler.into(),
        })
        .await
    }

    /// Schedule a job every `every`, first due one period from now.
    pub async fn schedule_interval(
        &self,
        name: impl Into<String>,
        every: Duration,
        options: JobOptions,
        handler: impl Into<String>,
    ) -> Result<Job> {
        self.schedule(NewJob {
            name: name.into(),
            schedule: ScheduleSpec::interval(every),
            timezone: self.default_timezone,
            options,
            handler: handler.into(),
        })
        .await
    }

    pub async fn schedule(&self, new_job: NewJob) -> Result<Job> {
        if new_job.name.trim().is_empty() {
            return Err(TempoError::validation("job name must not be empty"));
        }
        if !self.handlers.contains(&new_job.handler) {
            // Handlers may be registered later; executions fail until then.
            tracing::warn!(
                job_name = %new_job.name,
                handler = %new_job.handler,
                "Scheduling job with no registered handler"
            );
        }

        let job = self.store.create(new_job).await?;
        tracing::info!(
            job_id = %job.id,
            job_name = %job.name,
            kind = %job.kind(),
            next_run_at = ?job.next_run_at,
            "Job scheduled"
        );
        Ok(job)
    }

    // ─── Status transitions ────────────────────────────────────────────────────

    /// Stop regular dispatches. A running cycle finishes first, then the job pauses.
    pub async fn pause(&self, id: JobId) -> Result<Job> {
        self.transition(id, |job| match job.status {
            JobStatus::Scheduled => Ok(Some(StatusChange::new(JobStatus::Paused, job.next_run_at))),
            JobStatus::Paused => Ok(None),
            JobStatus::Running if job.requested_status.is_none() => {
                Ok(Some(StatusChange::request(job, Some(JobStatus::Paused))))
            }
            JobStatus::Running => Ok(None),
            JobStatus::Completed | JobStatus::Cancelled => Err(TempoError::invalid_state_transition(
                job.id,
                job.status,
                JobStatus::Paused,
            )),
        })
        .await
    }

    /// Return a paused job to the schedule, computing its next run from now.
    pub async fn resume(&self, id: JobId) -> Result<Job> {
        let now = Utc::now();
        self.transition(id, |job| match (job.status, job.requested_status) {
            (JobStatus::Paused, _) => {
                let next = job.schedule.next_run_on_resume(&job.timezone, now)?;
                Ok(Some(StatusChange::new(JobStatus::Scheduled, Some(next))))
            }
            (JobStatus::Scheduled, _) | (JobStatus::Running, None) => Ok(None),
            (JobStatus::Running, Some(JobStatus::Paused)) => Ok(Some(StatusChange::request(job, None))),
            (status, _) => Err(TempoError::invalid_state_transition(
                job.id,
                status,
                JobStatus::Scheduled,
            )),
        })
        .await
    }

    /// Cancel permanently. A running cycle finishes first.
    pub async fn cancel(&self, id: JobId) -> Result<Job> {
        self.transition(id, |job| match (job.status, job.requested_status) {
            (JobStatus::Scheduled | JobStatus::Paused, _) => {
                Ok(Some(StatusChange::new(JobStatus::Cancelled, None)))
            }
            (JobStatus::Running, Some(JobStatus::Cancelled)) | (JobStatus::Cancelled, _) => Ok(None),
            (JobStatus::Running, _) => Ok(Some(StatusChange::request(job, Some(JobStatus::Cancelled)))),
            (JobStatus::Completed, _) => Err(TempoError::invalid_state_transition(
                job.id,
                JobStatus::Completed,
                JobStatus::Cancelled,
            )),
        })
        .await
    }

    /// Apply the change `decide` picks for the current job state, re-reading on conflicts.
    ///
    /// `decide` returning `None` leaves the job untouched.
    async fn transition<F>(&self, id: JobId, decide: F) -> Result<Job>
    where
        F: Fn(&Job) -> Result<Option<StatusChange>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let job = self.store.get(id).await?;
            let Some(change) = decide(&job)? else {
                return Ok(job);
            };

            match self.store.update_status(id, job.version, change).await {
                Ok(updated) => {
                    tracing::info!(
                        job_id = %id,
                        from = %job.status,
                        to = %updated.status,
                        requested = ?updated.requested_status,
                        "Job status changed"
                    );
                    return Ok(updated);
                }
                Err(e) if e.is(ErrorCode::ConcurrentModification) && attempt < MAX_WRITE_ATTEMPTS => {
                    tracing::debug!(job_id = %id, attempt, "Job changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Change a job's definition. The schedule kind cannot change.
    pub async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let job = self.store.get(id).await?;
            match self.store.update_schedule(id, job.version, update.clone()).await {
                Ok(updated) => {
                    tracing::info!(job_id = %id, next_run_at = ?updated.next_run_at, "Job updated");
                    return Ok(updated);
                }
                Err(e) if e.is(ErrorCode::ConcurrentModification) && attempt < MAX_WRITE_ATTEMPTS => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove a job and its history.
    ///
    /// An execution already running finishes; whatever history it writes is purged.
    pub async fn delete(&self, id: JobId) -> Result<Job> {
        let job = self.store.delete(id).await?;
        let purged = self.history.purge(id).await?;
        tracing::info!(job_id = %id, job_name = %job.name, purged, "Job deleted");
        Ok(job)
    }

    // ─── Queries ───────────────────────────────────────────────────────────────

    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list(filter).await
    }

    /// Most recent execution records, newest first.
    pub async fn get_history(&self, id: JobId, limit: usize) -> Result<Vec<ExecutionRecord>> {
        self.store.get(id).await?;
        self.history.list(id, limit).await
    }

    /// Most recent dead-letter entries, newest first.
    pub fn dead_letters(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.dead_letters.recent(limit)
    }

    // ─── Dead letters ──────────────────────────────────────────────────────────

    /// Run a dead-lettered job again as a fresh execution cycle, starting at attempt 1.
    ///
    /// The job must still be `scheduled`; the entry is kept otherwise. Its regular
    /// schedule is left as it is.
    pub async fn retry_dead_letter(&self, entry_id: Uuid) -> Result<Job> {
        let entry = self
            .dead_letters
            .get(entry_id)
            .with_error_code(ErrorCode::DeadLetterNotFound)?;
        let job = self.store.get(entry.job_id).await?;
        if job.status != JobStatus::Scheduled {
            return Err(TempoError::invalid_state_transition(job.id, job.status, JobStatus::Running));
        }
        if self.queue.is_closed() {
            return Err(TempoError::with_internal(
                ErrorCode::InvalidStateTransition,
                "job manager has been shut down",
                "retry_dead_letter called after shutdown",
            ));
        }

        self.dead_letters
            .remove(entry_id)
            .with_error_code(ErrorCode::DeadLetterNotFound)?;
        // Already queued means a dispatch is pending anyway.
        let queued = self.queue.push(DispatchItem::scheduled(job.id, job.priority, Utc::now()));
        tracing::info!(
            dead_letter_id = %entry_id,
            job_id = %job.id,
            job_name = %job.name,
            queued,
            "Retrying dead-lettered job"
        );
        Ok(job)
    }

    /// Discard a single dead-letter entry.
    pub fn remove_dead_letter(&self, entry_id: Uuid) -> Result<DeadLetterEntry> {
        self.dead_letters
            .remove(entry_id)
            .with_error_code(ErrorCode::DeadLetterNotFound)
    }

    /// Discard every dead-letter entry, returning how many were dropped.
    pub fn clear_dead_letters(&self) -> usize {
        let cleared = self.dead_letters.clear();
        tracing::info!(cleared, "Dead letter queue cleared");
        cleared
    }

    pub fn stats(&self) -> ManagerStats {
        let workers = self.executor.stats();
        ManagerStats {
            queue_depth: self.queue.len(),
            active_executions: workers.active(),
            executions_processed: workers.processed(),
            executions_succeeded: workers.succeeded(),
            executions_failed: workers.failed(),
            executions_timed_out: workers.timed_out(),
            executions_cancelled: workers.cancelled(),
            retries_scheduled: workers.retries_scheduled(),
            dispatches_dropped_by_lease: workers.dropped_by_lease(),
            dead_letters: self.dead_letters.len(),
        }
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────────

    /// Run one scheduler tick now, independent of the background loop.
    pub async fn run_tick(&self) -> Result<TickReport> {
        self.scheduler.tick().await
    }

    /// Spawn the scheduler loop and the worker pool.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running { .. } => {
                return Err(TempoError::with_internal(
                    ErrorCode::InvalidStateTransition,
                    "job manager is already running",
                    "start called twice",
                ))
            }
            Lifecycle::Stopped => {
                return Err(TempoError::with_internal(
                    ErrorCode::InvalidStateTransition,
                    "job manager has been shut down",
                    "start called after shutdown",
                ))
            }
        }

        let workers = WorkerPool::new(self.config.worker_config(), Arc::clone(&self.executor)).start();
        let scheduler = Arc::clone(&self.scheduler).spawn();
        *lifecycle = Lifecycle::Running { scheduler, workers };

        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            worker_pool_size = self.config.worker_pool_size,
            default_timezone = %self.default_timezone,
            "Job manager started"
        );
        Ok(())
    }

    /// Stop scheduling, signal running handlers and wait for executors.
    ///
    /// Returns `false` if executors were still busy after the shutdown grace period.
    pub async fn shutdown(&self) -> bool {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        self.shutdown.cancel();

        match previous {
            Lifecycle::Running { scheduler, workers } => {
                if let Err(e) = scheduler.await {
                    tracing::error!(error = %e, "Scheduler loop task failed");
                }
                let clean = workers.shutdown().await;
                tracing::info!(clean, "Job manager stopped");
                clean
            }
            Lifecycle::Idle => {
                self.queue.close();
                true
            }
            Lifecycle::Stopped => true,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobPriority, ScheduleKind};
    use chrono::Duration as ChronoDuration;

    fn manager() -> JobManager {
        let handlers = HandlerRegistry::new();
        handlers.register_fn("noop", |_ctx| async { Ok(()) });
        JobManager::new(SchedulerConfig::default(), handlers).unwrap()
    }

    /// Force a job into `running` the way an executor would.
    async fn mark_running(manager: &JobManager, id: JobId) -> Job {
        let job = manager.get(id).await.unwrap();
        manager
            .store
            .update_status(id, job.version, StatusChange::new(JobStatus::Running, job.next_run_at))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_schedule_cron_uses_default_timezone() {
        let config = SchedulerConfig {
            default_timezone: "Asia/Tokyo".to_string(),
            ..Default::default()
        };
        let manager = JobManager::new(config, HandlerRegistry::new()).unwrap();

        let job = manager
            .schedule_cron("report", "0 9 * * *", None, JobOptions::default(), "noop")
            .await
            .unwrap();
        assert_eq!(job.timezone, chrono_tz::Asia::Tokyo);
        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(job.next_run_at.unwrap() > Utc::now());

        let explicit = manager
            .schedule_cron("report-ny", "0 9 * * *", Some("America/New_York"), JobOptions::default(), "noop")
            .await
            .unwrap();
        assert_eq!(explicit.timezone, chrono_tz::America::New_York);
    }

    #[tokio::test]
    async fn test_schedule_rejects_invalid_specs() {
        let manager = manager();

        let err = manager
            .schedule_cron("bad", "61 * * * *", None, JobOptions::default(), "noop")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScheduleSpec);

        let err = manager
            .schedule_cron("bad-tz", "* * * * *", Some("Atlantis/Capital"), JobOptions::default(), "noop")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScheduleSpec);

        let err = manager
            .schedule_once("past", Utc::now() - ChronoDuration::seconds(5), JobOptions::default(), "noop")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScheduleSpec);

        let err = manager
            .schedule_interval("zero", Duration::ZERO, JobOptions::default(), "noop")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScheduleSpec);

        let err = manager
            .schedule_interval(" ", Duration::from_secs(1), JobOptions::default(), "noop")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        assert!(manager.list(&JobFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume_are_idempotent() {
        let manager = manager();
        let job = manager
            .schedule_interval("tick", Duration::from_secs(60), JobOptions::default(), "noop")
            .await
            .unwrap();

        let paused = manager.pause(job.id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.next_run_at, job.next_run_at);
        assert_eq!(paused.version, job.version + 1);

        let again = manager.pause(job.id).await.unwrap();
        assert_eq!(again.version, paused.version);

        let resumed = manager.resume(job.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Scheduled);
        assert!(resumed.next_run_at.unwrap() > Utc::now());

        let again = manager.resume(job.id).await.unwrap();
        assert_eq!(again.version, resumed.version);
    }

    #[tokio::test]
    async fn test_resume_recomputes_from_now() {
        let manager = manager();
        let job = manager
            .schedule_cron("minutely", "* * * * *", None, JobOptions::default(), "noop")
            .await
            .unwrap();

        // Simulate a long pause whose stored next run is in the past.
        let stale = Utc::now() - ChronoDuration::hours(3);
        manager
            .store
            .update_status(job.id, job.version, StatusChange::new(JobStatus::Paused, Some(stale)))
            .await
            .unwrap();

        let resumed = manager.resume(job.id).await.unwrap();
        let next = resumed.next_run_at.unwrap();
        assert!(next > Utc::now());
        assert!(next <= Utc::now() + ChronoDuration::seconds(61));
    }

    #[tokio::test]
    async fn test_running_job_records_requested_transitions() {
        let manager = manager();
        let job = manager
            .schedule_interval("busy", Duration::from_secs(60), JobOptions::default(), "noop")
            .await
            .unwrap();
        mark_running(&manager, job.id).await;

        let paused = manager.pause(job.id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Running);
        assert_eq!(paused.requested_status, Some(JobStatus::Paused));

        let resumed = manager.resume(job.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Running);
        assert_eq!(resumed.requested_status, None);

        let cancelled = manager.cancel(job.id).await.unwrap();
        assert_eq!(cancelled.requested_status, Some(JobStatus::Cancelled));

        // Cancel wins over a later pause request.
        let paused = manager.pause(job.id).await.unwrap();
        assert_eq!(paused.requested_status, Some(JobStatus::Cancelled));
        assert_eq!(paused.version, cancelled.version);

        let err = manager.resume(job.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let manager = manager();
        let job = manager
            .schedule_interval("short-lived", Duration::from_secs(60), JobOptions::default(), "noop")
            .await
            .unwrap();

        let cancelled = manager.cancel(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.next_run_at.is_none());

        assert_eq!(manager.cancel(job.id).await.unwrap().version, cancelled.version);
        assert_eq!(
            manager.pause(job.id).await.unwrap_err().code(),
            ErrorCode::InvalidStateTransition
        );
        assert_eq!(
            manager.resume(job.id).await.unwrap_err().code(),
            ErrorCode::InvalidStateTransition
        );
        assert_eq!(
            manager
                .update(job.id, JobUpdate::new().priority(JobPriority::High))
                .await
                .unwrap_err()
                .code(),
            ErrorCode::InvalidStateTransition
        );
    }

    #[tokio::test]
    async fn test_update_changes_definition() {
        let manager = manager();
        let job = manager
            .schedule_interval("sync", Duration::from_secs(3600), JobOptions::default(), "noop")
            .await
            .unwrap();

        let updated = manager
            .update(
                job.id,
                JobUpdate::new()
                    .name("sync-fast")
                    .priority(JobPriority::Critical)
                    .schedule(ScheduleSpec::interval(Duration::from_secs(60))),
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "sync-fast");
        assert_eq!(updated.priority, JobPriority::Critical);
        assert!(updated.next_run_at.unwrap() < job.next_run_at.unwrap());

        let err = manager
            .update(job.id, JobUpdate::new().schedule(ScheduleSpec::cron("* * * * *")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidScheduleSpec);
        assert_eq!(manager.get(job.id).await.unwrap().kind(), ScheduleKind::Interval);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let manager = manager();
        let id = JobId::new();

        for err in [
            manager.get(id).await.unwrap_err(),
            manager.pause(id).await.unwrap_err(),
            manager.resume(id).await.unwrap_err(),
            manager.cancel(id).await.unwrap_err(),
            manager.delete(id).await.unwrap_err(),
            manager.get_history(id, 10).await.unwrap_err(),
        ] {
            assert_eq!(err.code(), ErrorCode::JobNotFound);
        }
    }

    #[tokio::test]
    async fn test_delete_purges_history() {
        let manager = manager();
        let job = manager
            .schedule_interval("tmp", Duration::from_secs(60), JobOptions::default(), "noop")
            .await
            .unwrap();
        let now = Utc::now();
        manager
            .history
            .append(ExecutionRecord::success(job.id, 1, now, now))
            .await
            .unwrap();
        assert_eq!(manager.get_history(job.id, 10).await.unwrap().len(), 1);

        manager.delete(job.id).await.unwrap();
        assert_eq!(manager.history.count(job.id).await.unwrap(), 0);
        assert_eq!(
            manager.get(job.id).await.unwrap_err().code(),
            ErrorCode::JobNotFound
        );
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_shutdown_is_clean() {
        let manager = manager();
        manager.start().unwrap();
        assert!(manager.is_running());
        assert_eq!(
            manager.start().unwrap_err().code(),
            ErrorCode::InvalidStateTransition
        );

        assert!(manager.shutdown().await);
        assert!(!manager.is_running());
        assert!(manager.start().is_err());
        assert!(manager.shutdown().await);
    }

    #[tokio::test]
    async fn test_run_tick_enqueues_due_jobs() {
        let manager = manager();
        let job = manager
            .schedule_once(
                "soon",
                Utc::now() + ChronoDuration::milliseconds(20),
                JobOptions::default(),
                "noop",
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let report = manager.run_tick().await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(manager.stats().queue_depth, 1);
        assert!(manager.queue.is_queued(job.id));
    }

    fn dead_letter_for(job: &Job) -> DeadLetterEntry {
        DeadLetterEntry {
            id: Uuid::new_v4(),
            job_id: job.id,
            job_name: job.name.clone(),
            handler: job.handler.clone(),
            attempts: 4,
            outcome: crate::jobs::ExecutionOutcome::Failure,
            error_detail: Some("boom".to_string()),
            moved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_retry_dead_letter_runs_fresh_cycle() {
        let manager = manager();
        let job = manager
            .schedule_cron("nightly", "0 2 * * *", None, JobOptions::default(), "noop")
            .await
            .unwrap();
        let entry = dead_letter_for(&job);
        manager.dead_letters.push(entry.clone());

        manager.retry_dead_letter(entry.id).await.unwrap();
        assert!(manager.dead_letters(10).is_empty());
        assert!(manager.queue.is_queued(job.id));

        manager.start().unwrap();
        for _ in 0..200 {
            if manager.history.count(job.id).await.unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let history = manager.get_history(job.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attempt, 1);
        assert_eq!(history[0].outcome, crate::jobs::ExecutionOutcome::Success);

        // The regular schedule is untouched.
        for _ in 0..200 {
            if manager.get(job.id).await.unwrap().status == JobStatus::Scheduled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let after = manager.get(job.id).await.unwrap();
        assert_eq!(after.status, JobStatus::Scheduled);
        assert_eq!(after.next_run_at, job.next_run_at);
        assert!(manager.shutdown().await);
    }

    #[tokio::test]
    async fn test_retry_dead_letter_requires_scheduled_job() {
        let manager = manager();
        let job = manager
            .schedule_cron("nightly", "0 2 * * *", None, JobOptions::default(), "noop")
            .await
            .unwrap();
        let entry = dead_letter_for(&job);
        manager.dead_letters.push(entry.clone());
        manager.pause(job.id).await.unwrap();

        let err = manager.retry_dead_letter(entry.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
        assert_eq!(manager.dead_letters(10), vec![entry.clone()]);
        assert!(manager.queue.is_empty());

        let err = manager.retry_dead_letter(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeadLetterNotFound);

        manager.resume(job.id).await.unwrap();
        assert!(manager.shutdown().await);
        let err = manager.retry_dead_letter(entry.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
        assert_eq!(manager.dead_letters(10).len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_clear_dead_letters() {
        let manager = manager();
        let job = manager
            .schedule_cron("nightly", "0 2 * * *", None, JobOptions::default(), "noop")
            .await
            .unwrap();
        let first = dead_letter_for(&job);
        let second = dead_letter_for(&job);
        manager.dead_letters.push(first.clone());
        manager.dead_letters.push(second.clone());

        assert_eq!(manager.remove_dead_letter(first.id).unwrap(), first);
        let err = manager.remove_dead_letter(first.id).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeadLetterNotFound);
        assert_eq!(manager.stats().dead_letters, 1);

        assert_eq!(manager.clear_dead_letters(), 1);
        assert!(manager.dead_letters(10).is_empty());
    }
}
