//! Job scheduling core.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  due jobs   ┌────────────────┐  pop   ┌──────────────────┐
//! │  Scheduler   │────────────▶│ Dispatch Queue │───────▶│   Worker Pool    │
//! │    Loop      │             │ (priority heap)│        │ (N executors)    │
//! └──────┬───────┘             └────────────────┘        └───┬──────┬───────┘
//!        │ next_run_at                         retry (backoff) │      │ records
//!        ▼                                                     ▼      ▼
//! ┌──────────────┐◀──────────── status / version ───────┌──────────────────┐
//! │  Job Store   │                                      │  History Store   │
//! └──────────────┘                                      └──────────────────┘
//! ```
//!
//! The [`JobManager`] facade owns every component. Handlers are resolved by name
//! through the [`HandlerRegistry`] when a job executes.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tempo_core::config::SchedulerConfig;
//! use tempo_core::jobs::{HandlerRegistry, JobManager, JobOptions, JobPriority};
//!
//! # async fn run() -> tempo_core::Result<()> {
//! let handlers = HandlerRegistry::new();
//! handlers.register_fn("cleanup", |ctx| async move {
//!     ctx.log_info("cleaning up");
//!     Ok(())
//! });
//!
//! let manager = JobManager::new(SchedulerConfig::default(), handlers)?;
//! manager
//!     .schedule_cron(
//!         "nightly-cleanup",
//!         "0 2 * * *",
//!         Some("Europe/Paris"),
//!         JobOptions::default().with_priority(JobPriority::High),
//!         "cleanup",
//!     )
//!     .await?;
//! manager
//!     .schedule_interval("heartbeat", Duration::from_secs(30), JobOptions::default(), "log")
//!     .await?;
//!
//! manager.start()?;
//! // ...
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod cron;
pub mod handler;
pub mod history;
pub mod job;
pub mod lease;
pub mod manager;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use builtin::{register_builtins, LogHandler};
pub use cron::{next_occurrence, parse_timezone, CronExpression};
pub use handler::{FnHandler, HandlerRegistry, JobContext, JobHandler};
pub use history::{HistoryStore, InMemoryHistoryStore, DEFAULT_RETENTION_PER_JOB};
pub use job::{
    ExecutionOutcome, ExecutionRecord, Job, JobError, JobId, JobOptions, JobPriority, JobResult,
    JobStatus, NewJob, ScheduleKind, ScheduleSpec,
};
pub use lease::{JobLease, LeaseTable};
pub use manager::{JobManager, JobManagerBuilder, ManagerStats};
pub use queue::{DeadLetterEntry, DeadLetterQueue, DispatchItem, DispatchQueue};
pub use retry::{next_retry_delay, RetryPolicy};
pub use scheduler::{SchedulerLoop, TickReport};
pub use store::{InMemoryJobStore, JobFilter, JobStore, JobUpdate, StatusChange};
pub use worker::{JobExecutor, WorkerConfig, WorkerHandle, WorkerPool, WorkerStats};
