//! Job store: the single source of truth for which jobs exist.
//!
//! Every mutation takes the caller's last-known `version` and fails with
//! `ConcurrentModification` if the stored job has moved on. This is what keeps the
//! scheduler loop, the worker pool and external pause/cancel calls from overwriting
//! each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

use super::{Job, JobId, JobPriority, JobStatus, NewJob, ScheduleKind, ScheduleSpec};
use crate::error::{Result, TempoError};

// ═══════════════════════════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════════════════════════

/// Selection criteria for [`JobStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<ScheduleKind>,
    pub priority: Option<JobPriority>,
    /// Only jobs whose `next_run_at` is at or before this instant
    pub due_before: Option<DateTime<Utc>>,
    /// Case-insensitive substring match on the name
    pub name_contains: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduled jobs whose `next_run_at <= now`.
    pub fn due(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Scheduled),
            due_before: Some(now),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_kind(mut self, kind: ScheduleKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_name(mut self, fragment: impl Into<String>) -> Self {
        self.name_contains = Some(fragment.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        if self.status.is_some_and(|s| s != job.status) {
            return false;
        }
        if self.kind.is_some_and(|k| k != job.kind()) {
            return false;
        }
        if self.priority.is_some_and(|p| p != job.priority) {
            return false;
        }
        if let Some(cutoff) = self.due_before {
            if !job.next_run_at.is_some_and(|at| at <= cutoff) {
                return false;
            }
        }
        if let Some(fragment) = &self.name_contains {
            if !job.name.to_lowercase().contains(&fragment.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Replacement values for a job's scheduling state.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: JobStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub requested_status: Option<JobStatus>,
}

impl StatusChange {
    pub fn new(status: JobStatus, next_run_at: Option<DateTime<Utc>>) -> Self {
        Self {
            status,
            next_run_at,
            requested_status: None,
        }
    }

    /// Keep everything but record a deferred pause or cancel.
    pub fn request(job: &Job, requested: Option<JobStatus>) -> Self {
        Self {
            status: job.status,
            next_run_at: job.next_run_at,
            requested_status: requested,
        }
    }

    pub fn with_requested(mut self, requested: Option<JobStatus>) -> Self {
        self.requested_status = requested;
        self
    }
}

/// Changes to a job's definition. The schedule kind itself may not change.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub schedule: Option<ScheduleSpec>,
    pub timezone: Option<Tz>,
    pub priority: Option<JobPriority>,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn schedule(mut self, schedule: ScheduleSpec) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn timezone(mut self, timezone: Tz) -> Self {
        self.timezone = Some(timezone);
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn touches_schedule(&self) -> bool {
        self.schedule.is_some() || self.timezone.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable record of job definitions and their mutable status.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Validate and insert a new job in `scheduled` state with `next_run_at` computed.
    async fn create(&self, new_job: NewJob) -> Result<Job>;

    async fn get(&self, id: JobId) -> Result<Job>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Replace status, `next_run_at` and `requested_status`.
    async fn update_status(&self, id: JobId, expected_version: u64, change: StatusChange) -> Result<Job>;

    /// Change the job definition, recomputing `next_run_at` when the schedule moved.
    async fn update_schedule(&self, id: JobId, expected_version: u64, update: JobUpdate) -> Result<Job>;

    /// Remove a job, returning its last state.
    async fn delete(&self, id: JobId) -> Result<Job>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory job store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Look up a job and verify the caller's version under the write lock.
    fn checked<'a>(jobs: &'a mut HashMap<JobId, Job>, id: JobId, expected_version: u64) -> Result<&'a mut Job> {
        let job = jobs.get_mut(&id).ok_or_else(|| TempoError::job_not_found(id))?;
        if job.version != expected_version {
            return Err(TempoError::concurrent_modification(id, expected_version, job.version));
        }
        Ok(job)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job> {
        new_job.options.validate()?;
        let now = Utc::now();
        let next_run_at = new_job.schedule.first_run(&new_job.timezone, now)?;

        let job = Job {
            id: JobId::new(),
            name: new_job.name,
            schedule: new_job.schedule,
            timezone: new_job.timezone,
            priority: new_job.options.priority,
            max_retries: new_job.options.max_retries,
            timeout: new_job.options.timeout,
            handler: new_job.handler,
            status: JobStatus::Scheduled,
            next_run_at: Some(next_run_at),
            requested_status: None,
            created_at: now,
            updated_at: now,
            version: 1,
        };

        self.jobs.write().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| TempoError::job_not_found(id))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn update_status(&self, id: JobId, expected_version: u64, change: StatusChange) -> Result<Job> {
        let mut jobs = self.jobs.write();
        let job = Self::checked(&mut jobs, id, expected_version)?;

        if job.status.is_terminal() && job.status != change.status {
            return Err(TempoError::invalid_state_transition(id, job.status, change.status));
        }
        if change.status == JobStatus::Completed && job.kind() != ScheduleKind::Once {
            return Err(TempoError::invalid_state_transition(id, job.status, change.status));
        }

        job.status = change.status;
        job.next_run_at = change.next_run_at;
        job.requested_status = change.requested_status;
        job.updated_at = Utc::now();
        job.version += 1;
        Ok(job.clone())
    }

    async fn update_schedule(&self, id: JobId, expected_version: u64, update: JobUpdate) -> Result<Job> {
        let mut jobs = self.jobs.write();
        let job = Self::checked(&mut jobs, id, expected_version)?;

        if job.status.is_terminal() {
            return Err(TempoError::invalid_state_transition(id, job.status, job.status));
        }
        if let Some(schedule) = &update.schedule {
            if schedule.kind() != job.kind() {
                return Err(TempoError::invalid_schedule(format!(
                    "schedule kind cannot change from {} to {}",
                    job.kind(),
                    schedule.kind()
                )));
            }
        }
        if let Some(timeout) = update.timeout {
            if timeout.is_zero() {
                return Err(TempoError::validation("timeout must be greater than zero"));
            }
        }

        let now = Utc::now();
        let next_run_at = if update.touches_schedule() {
            let schedule = update.schedule.as_ref().unwrap_or(&job.schedule);
            let timezone = update.timezone.unwrap_or(job.timezone);
            Some(schedule.first_run(&timezone, now)?)
        } else {
            job.next_run_at
        };

        if let Some(name) = update.name {
            job.name = name;
        }
        if let Some(schedule) = update.schedule {
            job.schedule = schedule;
        }
        if let Some(timezone) = update.timezone {
            job.timezone = timezone;
        }
        if let Some(priority) = update.priority {
            job.priority = priority;
        }
        if let Some(max_retries) = update.max_retries {
            job.max_retries = max_retries;
        }
        if let Some(timeout) = update.timeout {
            job.timeout = timeout;
        }
        job.next_run_at = next_run_at;
        job.updated_at = now;
        job.version += 1;
        Ok(job.clone())
    }

    async fn delete(&self, id: JobId) -> Result<Job> {
        self.jobs
            .write()
            .remove(&id)
            .ok_or_else(|| TempoError::job_not_found(id))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
