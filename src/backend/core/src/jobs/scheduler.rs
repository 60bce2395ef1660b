//! Scheduler loop: due detection and dispatch.
//!
//! Every poll interval the loop asks the job store for scheduled jobs whose
//! `next_run_at` has passed, advances each job's `next_run_at` right away and pushes the
//! whole batch onto the dispatch queue. Advancing on dispatch (rather than on completion) keeps the
//! cadence independent of execution time.
//!
//! A loop that wakes late processes every overdue job exactly once; missed occurrences
//! are skipped, never replayed.

use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::lease::LeaseTable;
use super::queue::{DispatchItem, DispatchQueue};
use super::store::{JobFilter, JobStore, StatusChange};
use super::{Job, ScheduleKind};
use crate::error::{ErrorCode, Result};

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs found due
    pub due: usize,
    /// Jobs pushed onto the dispatch queue
    pub enqueued: usize,
    /// Occurrences skipped because the job was already queued or executing
    pub skipped_busy: usize,
    /// Jobs left for the next tick because another writer changed them first
    pub skipped_conflict: usize,
    /// Jobs whose next run could not be computed
    pub errors: usize,
}

/// Periodic due-check driving the dispatch queue.
pub struct SchedulerLoop {
    store: Arc<dyn JobStore>,
    queue: Arc<DispatchQueue>,
    leases: Arc<LeaseTable>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<DispatchQueue>,
        leases: Arc<LeaseTable>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue,
            leases,
            poll_interval,
            shutdown,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run one tick against the current time.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as if the clock read `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut due = self.store.list(&JobFilter::due(now)).await?;
        due.sort_by(|a, b| {
            a.next_run_at
                .cmp(&b.next_run_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };

        // Advance everything first and enqueue in one batch, so an idle executor
        // never sees a low-priority item before a higher one from the same tick.
        let mut batch = Vec::with_capacity(due.len());
        for job in due {
            let Some(due_at) = job.next_run_at else {
                continue;
            };

            match self.advance(&job, now).await {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped_conflict += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        job_name = %job.name,
                        error = %e,
                        "Skipping job this tick, next run could not be computed"
                    );
                    report.errors += 1;
                    continue;
                }
            }

            if self.queue.is_queued(job.id) || self.leases.is_held(job.id) {
                counter!("tempo_dispatch_skipped_total", "reason" => "busy").increment(1);
                tracing::debug!(job_id = %job.id, "Skipping occurrence, job is still queued or executing");
                report.skipped_busy += 1;
                continue;
            }

            batch.push(DispatchItem::scheduled(job.id, job.priority, due_at));
        }

        for item in &batch {
            counter!("tempo_jobs_dispatched_total", "priority" => item.priority.as_str()).increment(1);
        }
        report.enqueued = self.queue.push_batch(batch);

        if report.due > 0 {
            tracing::debug!(
                due = report.due,
                enqueued = report.enqueued,
                skipped_busy = report.skipped_busy,
                skipped_conflict = report.skipped_conflict,
                errors = report.errors,
                "Scheduler tick"
            );
        }
        Ok(report)
    }

    /// Move `next_run_at` past `now`. `Ok(false)` if the job changed under us.
    async fn advance(&self, job: &Job, now: DateTime<Utc>) -> Result<bool> {
        // A once job keeps its instant until its execution completes it, so a dispatch
        // that never reaches an executor is picked up again.
        if job.kind() == ScheduleKind::Once {
            return Ok(true);
        }

        let next = job.schedule.next_run_after_dispatch(&job.timezone, now)?;
        match self
            .store
            .update_status(job.id, job.version, StatusChange::new(job.status, next))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is(ErrorCode::ConcurrentModification) || e.is(ErrorCode::JobNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Tick until shutdown is signalled.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        e.log();
                        tracing::warn!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }

        tracing::info!("Scheduler loop stopped");
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{InMemoryJobStore, JobUpdate};
    use crate::jobs::{JobId, JobOptions, JobPriority, JobStatus, NewJob, ScheduleSpec};
    use async_trait::async_trait;
    use chrono_tz::Tz;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        queue: Arc<DispatchQueue>,
        leases: Arc<LeaseTable>,
        scheduler: SchedulerLoop,
    }

    fn fixture_with(store: Arc<dyn JobStore>, inner: Arc<InMemoryJobStore>) -> Fixture {
        let queue = Arc::new(DispatchQueue::new());
        let leases = LeaseTable::new();
        let scheduler = SchedulerLoop::new(
            store,
            queue.clone(),
            leases.clone(),
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        Fixture {
            store: inner,
            queue,
            leases,
            scheduler,
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        fixture_with(store.clone(), store)
    }

    async fn create(store: &InMemoryJobStore, schedule: ScheduleSpec, priority: JobPriority) -> Job {
        store
            .create(NewJob {
                name: "job".to_string(),
                schedule,
                timezone: Tz::UTC,
                options: JobOptions::default().with_priority(priority),
                handler: "noop".to_string(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_due_job_is_enqueued_and_advanced() {
        let fx = fixture();
        let job = create(&fx.store, ScheduleSpec::interval(Duration::from_secs(1)), JobPriority::Normal).await;
        let now = job.next_run_at.unwrap() + chrono::Duration::milliseconds(500);

        let report = fx.scheduler.tick_at(now).await.unwrap();
        assert_eq!(report.enqueued, 1);

        let after = fx.store.get(job.id).await.unwrap();
        assert_eq!(after.status, JobStatus::Scheduled);
        assert_eq!(after.next_run_at, Some(now + chrono::Duration::seconds(1)));

        // Same instant again: nothing is due any more.
        assert_eq!(fx.scheduler.tick_at(now).await.unwrap().due, 0);
    }

    #[tokio::test]
    async fn test_late_tick_dispatches_once_without_backlog() {
        let fx = fixture();
        let job = create(&fx.store, ScheduleSpec::interval(Duration::from_secs(1)), JobPriority::Normal).await;
        let now = job.next_run_at.unwrap() + chrono::Duration::seconds(100);

        let report = fx.scheduler.tick_at(now).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.enqueued, 1);
        assert_eq!(fx.queue.len(), 1);
        assert!(fx.store.get(job.id).await.unwrap().next_run_at.unwrap() > now);
    }

    #[tokio::test]
    async fn test_busy_job_occurrence_is_skipped() {
        let fx = fixture();
        let job = create(&fx.store, ScheduleSpec::interval(Duration::from_secs(1)), JobPriority::Normal).await;
        let _lease = fx.leases.try_acquire(job.id).unwrap();

        let now = job.next_run_at.unwrap();
        let report = fx.scheduler.tick_at(now).await.unwrap();
        assert_eq!(report.skipped_busy, 1);
        assert!(fx.queue.is_empty());
        // The occurrence is consumed, not replayed later.
        assert!(fx.store.get(job.id).await.unwrap().next_run_at.unwrap() > now);
    }

    #[tokio::test]
    async fn test_paused_jobs_are_not_due() {
        let fx = fixture();
        let job = create(&fx.store, ScheduleSpec::interval(Duration::from_secs(1)), JobPriority::Normal).await;
        fx.store
            .update_status(job.id, job.version, StatusChange::new(JobStatus::Paused, job.next_run_at))
            .await
            .unwrap();

        let report = fx.scheduler.tick_at(job.next_run_at.unwrap()).await.unwrap();
        assert_eq!(report, TickReport::default());
    }

    #[tokio::test]
    async fn test_once_job_keeps_instant_until_executed() {
        let fx = fixture();
        let at = Utc::now() + chrono::Duration::seconds(5);
        let job = create(&fx.store, ScheduleSpec::once(at), JobPriority::Normal).await;

        let first = fx.scheduler.tick_at(at).await.unwrap();
        assert_eq!(first.enqueued, 1);
        assert_eq!(fx.store.get(job.id).await.unwrap().next_run_at, Some(at));

        // Still waiting in the queue: not enqueued twice.
        let second = fx.scheduler.tick_at(at).await.unwrap();
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.skipped_busy, 1);
        assert_eq!(fx.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_order_follows_priority() {
        let fx = fixture();
        let low = create(&fx.store, ScheduleSpec::interval(Duration::from_secs(1)), JobPriority::Low).await;
        let critical = create(&fx.store, ScheduleSpec::interval(Duration::from_secs(1)), JobPriority::Critical).await;

        let now = Utc::now() + chrono::Duration::seconds(2);
        fx.scheduler.tick_at(now).await.unwrap();

        assert_eq!(fx.queue.try_pop().unwrap().job_id, critical.id);
        assert_eq!(fx.queue.try_pop().unwrap().job_id, low.id);
    }

    /// Serves one job with an expression that no longer parses.
    struct CorruptingStore {
        inner: Arc<InMemoryJobStore>,
        corrupt: parking_lot::Mutex<Option<JobId>>,
    }

    #[async_trait]
    impl JobStore for CorruptingStore {
        async fn create(&self, new_job: NewJob) -> Result<Job> {
            self.inner.create(new_job).await
        }

        async fn get(&self, id: JobId) -> Result<Job> {
            self.inner.get(id).await
        }

        async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
            let corrupt = *self.corrupt.lock();
            let mut jobs = self.inner.list(filter).await?;
            for job in jobs.iter_mut().filter(|j| Some(j.id) == corrupt) {
                job.schedule = ScheduleSpec::cron("61 * * * *");
            }
            Ok(jobs)
        }

        async fn update_status(&self, id: JobId, expected_version: u64, change: StatusChange) -> Result<Job> {
            self.inner.update_status(id, expected_version, change).await
        }

        async fn update_schedule(&self, id: JobId, expected_version: u64, update: JobUpdate) -> Result<Job> {
            self.inner.update_schedule(id, expected_version, update).await
        }

        async fn delete(&self, id: JobId) -> Result<Job> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_corrupted_cron_is_skipped_not_fatal() {
        let inner = Arc::new(InMemoryJobStore::new());
        let store = Arc::new(CorruptingStore {
            inner: inner.clone(),
            corrupt: parking_lot::Mutex::new(None),
        });
        let fx = fixture_with(store.clone(), inner);

        let bad = create(&fx.store, ScheduleSpec::cron("* * * * *"), JobPriority::Normal).await;
        let good = create(&fx.store, ScheduleSpec::cron("* * * * *"), JobPriority::Normal).await;
        *store.corrupt.lock() = Some(bad.id);

        let now = Utc::now() + chrono::Duration::minutes(2);
        let report = fx.scheduler.tick_at(now).await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.enqueued, 1);
        assert_eq!(fx.queue.try_pop().unwrap().job_id, good.id);
    }

    /// Yields before every write so waiting executors get a chance to run.
    struct YieldingStore {
        inner: Arc<InMemoryJobStore>,
    }

    #[async_trait]
    impl JobStore for YieldingStore {
        async fn create(&self, new_job: NewJob) -> Result<Job> {
            self.inner.create(new_job).await
        }

        async fn get(&self, id: JobId) -> Result<Job> {
            self.inner.get(id).await
        }

        async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
            self.inner.list(filter).await
        }

        async fn update_status(&self, id: JobId, expected_version: u64, change: StatusChange) -> Result<Job> {
            tokio::task::yield_now().await;
            self.inner.update_status(id, expected_version, change).await
        }

        async fn update_schedule(&self, id: JobId, expected_version: u64, update: JobUpdate) -> Result<Job> {
            tokio::task::yield_now().await;
            self.inner.update_schedule(id, expected_version, update).await
        }

        async fn delete(&self, id: JobId) -> Result<Job> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_waiting_executor_gets_highest_priority_of_tick() {
        let inner = Arc::new(InMemoryJobStore::new());
        let fx = fixture_with(Arc::new(YieldingStore { inner: inner.clone() }), inner);
        let low = create(&fx.store, ScheduleSpec::interval(Duration::from_secs(1)), JobPriority::Low).await;
        let critical = create(&fx.store, ScheduleSpec::interval(Duration::from_secs(1)), JobPriority::Critical).await;

        let waiter = {
            let queue = fx.queue.clone();
            tokio::spawn(async move { queue.pop().await.map(|item| item.job_id) })
        };
        tokio::task::yield_now().await;

        let now = Utc::now() + chrono::Duration::seconds(2);
        let report = fx.scheduler.tick_at(now).await.unwrap();
        assert_eq!(report.enqueued, 2);

        assert_eq!(waiter.await.unwrap(), Some(critical.id));
        assert_eq!(fx.queue.try_pop().unwrap().job_id, low.id);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(InMemoryJobStore::new());
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(SchedulerLoop::new(
            store,
            Arc::new(DispatchQueue::new()),
            LeaseTable::new(),
            Duration::from_millis(5),
            shutdown.clone(),
        ));

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
