//! Job definitions and execution records.
//!
//! This module provides the data model shared by every scheduling component:
//!
//! - **Job**: a schedulable unit of work and its mutable scheduling state
//! - **ScheduleSpec**: cron expression, one-off instant or fixed interval
//! - **JobStatus**: lifecycle state machine (`scheduled ⇄ running`, `paused`, terminal states)
//! - **ExecutionRecord**: immutable outcome of a single execution attempt
//! - **JobError**: error type returned by job handlers

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::cron::CronExpression;
use crate::error::{Result, TempoError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Scheduling lifecycle of a job.
///
/// Status tracks the schedule, not execution outcomes; those live in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_run_at`
    Scheduled,
    /// Skipped by the scheduler until resumed
    Paused,
    /// An execution cycle (including retries) is in flight
    Running,
    /// A `once` job whose single run concluded
    Completed,
    /// Explicitly cancelled
    Cancelled,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Paused => write!(f, "paused"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    /// Dispatched only when nothing more urgent is due
    Low = 0,
    /// Default for most jobs
    Normal = 1,
    /// Dispatched before normal jobs
    High = 2,
    /// Always dispatched first
    Critical = 3,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl JobPriority {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schedules
// ═══════════════════════════════════════════════════════════════════════════════

/// The three kinds of schedule. Fixed for the lifetime of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Once,
    Interval,
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cron => write!(f, "cron"),
            Self::Once => write!(f, "once"),
            Self::Interval => write!(f, "interval"),
        }
    }
}

/// When a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Recurring calendar schedule, interpreted in the job's timezone.
    Cron { expression: String },
    /// A single execution at an absolute instant.
    Once { at: DateTime<Utc> },
    /// Every `every`, measured from the moment each run is dispatched.
    Interval {
        #[serde(with = "humantime_serde")]
        every: Duration,
    },
}

impl ScheduleSpec {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
        }
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        Self::Once { at }
    }

    pub fn interval(every: Duration) -> Self {
        Self::Interval { every }
    }

    pub fn kind(&self) -> ScheduleKind {
        match self {
            Self::Cron { .. } => ScheduleKind::Cron,
            Self::Once { .. } => ScheduleKind::Once,
            Self::Interval { .. } => ScheduleKind::Interval,
        }
    }

    /// Validate the schedule and compute the first `next_run_at` for a new job.
    pub fn first_run(&self, timezone: &Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Self::Cron { expression } => CronExpression::parse(expression)?.next_after(timezone, now),
            Self::Once { at } => {
                if *at <= now {
                    return Err(TempoError::invalid_schedule(format!(
                        "once timestamp {} is not in the future",
                        at.to_rfc3339()
                    )));
                }
                Ok(*at)
            }
            Self::Interval { every } => add_interval(now, *every),
        }
    }

    /// Next run computed at the moment a run is dispatched.
    ///
    /// Returns `None` for `once` jobs, which never run again.
    pub fn next_run_after_dispatch(&self, timezone: &Tz, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self {
            Self::Cron { expression } => CronExpression::parse(expression)?
                .next_after(timezone, now)
                .map(Some),
            Self::Once { .. } => Ok(None),
            Self::Interval { every } => add_interval(now, *every).map(Some),
        }
    }

    /// Next run once an execution cycle finished at `finished_at`.
    ///
    /// Keeps `current` when it is still strictly after `finished_at`, so that a run which
    /// completes before its next slot does not shift the cadence.
    pub fn next_run_after_completion(
        &self,
        timezone: &Tz,
        current: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        if let Self::Once { .. } = self {
            return Ok(None);
        }
        match current {
            Some(next) if next > finished_at => Ok(Some(next)),
            _ => self.next_run_after_dispatch(timezone, finished_at),
        }
    }

    /// Next run for a job being resumed: always recomputed from `now`.
    pub fn next_run_on_resume(&self, timezone: &Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Self::Cron { expression } => CronExpression::parse(expression)?.next_after(timezone, now),
            Self::Once { at } => Ok((*at).max(now)),
            Self::Interval { every } => add_interval(now, *every),
        }
    }
}

fn add_interval(from: DateTime<Utc>, every: Duration) -> Result<DateTime<Utc>> {
    if every < Duration::from_millis(1) {
        return Err(TempoError::invalid_schedule(
            "interval must be at least one millisecond",
        ));
    }
    chrono::Duration::from_std(every)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .ok_or_else(|| TempoError::invalid_schedule("interval is too large"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-job execution settings shared by all schedule kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub priority: JobPriority,

    /// Retries allowed per execution (0 = single attempt)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wall-clock bound on one attempt
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            max_retries: default_max_retries(),
            timeout: default_timeout(),
        }
    }
}

impl JobOptions {
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(TempoError::validation("timeout must be greater than zero"));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// Input for creating a job in a store.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub schedule: ScheduleSpec,
    pub timezone: Tz,
    pub options: JobOptions,
    /// Name of the handler resolved through the handler registry at execution time
    pub handler: String,
}

/// A schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub schedule: ScheduleSpec,
    pub timezone: Tz,
    pub priority: JobPriority,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub handler: String,
    pub status: JobStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Pause or cancel requested while running; applied when the execution cycle ends
    pub requested_status: Option<JobStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every mutation, used for optimistic concurrency
    pub version: u64,
}

impl Job {
    pub fn kind(&self) -> ScheduleKind {
        self.schedule.kind()
    }

    /// Whether the scheduler should dispatch this job at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Scheduled && self.next_run_at.is_some_and(|at| at <= now)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Records
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub job_id: JobId,
    /// 1-based attempt number within the execution cycle
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    /// Present iff `outcome` is not `Success`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl ExecutionRecord {
    pub fn success(job_id: JobId, attempt: u32, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            attempt,
            started_at,
            finished_at,
            outcome: ExecutionOutcome::Success,
            error_detail: None,
        }
    }

    pub fn unsuccessful(
        job_id: JobId,
        attempt: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: ExecutionOutcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            attempt,
            started_at,
            finished_at,
            outcome,
            error_detail: Some(detail.into()),
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type returned by job handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether the retry policy may schedule another attempt
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
        }
    }

    /// Create a new non-retryable (fatal) error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<TempoError> for JobError {
    fn from(error: TempoError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
        }
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
