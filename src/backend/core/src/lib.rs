#![allow(clippy::result_large_err)]
//! # Tempo Core
//!
//! Job scheduling core: cron, one-off and interval jobs dispatched by priority to a
//! bounded worker pool, with retries, execution history and a dead-letter queue.
//!
//! ## Architecture
//!
//! - **Cron Evaluator**: Five/six-field cron expressions evaluated in IANA timezones
//! - **Job Store**: Versioned job records with optimistic concurrency
//! - **Scheduler Loop**: Periodic due detection with drift-tolerant rescheduling
//! - **Worker Pool**: Bounded concurrent execution with timeouts and per-job leases
//! - **Retry Policy**: Exponential backoff with jitter
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result, TempoError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, SchedulerConfig};
    pub use crate::error::{ErrorCode, ErrorContext, Result, TempoError};
    pub use crate::jobs::{
        ExecutionOutcome, ExecutionRecord, HandlerRegistry, Job, JobContext, JobError, JobFilter,
        JobHandler, JobId, JobManager, JobOptions, JobPriority, JobResult, JobStatus, JobUpdate,
        ScheduleKind, ScheduleSpec,
    };
}
