//! Configuration for the scheduling core and the daemon around it.
//!
//! Values come from an optional TOML file plus `TEMPO__`-prefixed environment
//! variables, with `__` separating nested keys:
//!
//! ```text
//! TEMPO__SCHEDULER__WORKER_POOL_SIZE=4
//! TEMPO__SCHEDULER__POLL_INTERVAL=500ms
//! TEMPO__TELEMETRY__LOGGING__LEVEL=debug
//! ```

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TempoError};
use crate::jobs::cron::parse_timezone;
use crate::jobs::retry::RetryPolicy;
use crate::jobs::worker::WorkerConfig;
use crate::jobs::{JobOptions, ScheduleSpec};
use crate::telemetry::TelemetryConfig;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "TEMPO";

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Jobs the daemon creates at start
    #[serde(default)]
    pub bootstrap: Vec<BootstrapJob>,
}

/// Options consumed by the scheduler loop, worker pool and stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler loop tick cadence
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maximum concurrent executions
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// IANA zone applied to cron jobs created without one
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    #[serde(default = "default_history_retention")]
    pub history_retention_per_job: usize,

    #[serde(default = "default_base_retry_delay", with = "humantime_serde")]
    pub default_base_retry_delay: Duration,

    #[serde(default = "default_max_retry_delay", with = "humantime_serde")]
    pub default_max_retry_delay: Duration,

    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    /// How long running handlers get to finish after shutdown is signalled
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_worker_pool_size() -> usize {
    10
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_history_retention() -> usize {
    crate::jobs::history::DEFAULT_RETENTION_PER_JOB
}

fn default_base_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retry_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_dead_letter_capacity() -> usize {
    1000
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            worker_pool_size: default_worker_pool_size(),
            default_timezone: default_timezone(),
            history_retention_per_job: default_history_retention(),
            default_base_retry_delay: default_base_retry_delay(),
            default_max_retry_delay: default_max_retry_delay(),
            dead_letter_capacity: default_dead_letter_capacity(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(TempoError::configuration("worker_pool_size must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(TempoError::configuration("poll_interval must be greater than zero"));
        }
        if self.history_retention_per_job == 0 {
            return Err(TempoError::configuration(
                "history_retention_per_job must be at least 1",
            ));
        }
        if self.default_base_retry_delay > self.default_max_retry_delay {
            return Err(TempoError::configuration(format!(
                "default_base_retry_delay ({:?}) exceeds default_max_retry_delay ({:?})",
                self.default_base_retry_delay, self.default_max_retry_delay
            )));
        }
        self.timezone()?;
        Ok(())
    }

    /// The default timezone, parsed.
    pub fn timezone(&self) -> Result<Tz> {
        parse_timezone(&self.default_timezone).map_err(|e| {
            TempoError::configuration(format!(
                "unknown default_timezone '{}'",
                self.default_timezone
            ))
            .with_source(e)
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.default_base_retry_delay, self.default_max_retry_delay)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            pool_size: self.worker_pool_size,
            shutdown_grace: self.shutdown_grace,
            ..WorkerConfig::default()
        }
    }
}

/// A job declared in configuration.
///
/// ```toml
/// [[bootstrap]]
/// name = "heartbeat"
/// handler = "log"
/// schedule = { kind = "interval", every = "30s" }
/// options = { priority = "low", max_retries = 0 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapJob {
    pub name: String,

    pub schedule: ScheduleSpec,

    /// Falls back to `scheduler.default_timezone`
    #[serde(default)]
    pub timezone: Option<String>,

    #[serde(default)]
    pub options: JobOptions,

    #[serde(default = "default_bootstrap_handler")]
    pub handler: String,
}

fn default_bootstrap_handler() -> String {
    crate::jobs::builtin::LogHandler::NAME.to_string()
}

impl Config {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(Self::environment())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, with environment variables taking precedence.
    pub fn from_file(path: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        for job in &self.bootstrap {
            if let Some(tz) = &job.timezone {
                parse_timezone(tz).map_err(|e| {
                    TempoError::configuration(format!(
                        "bootstrap job '{}' has unknown timezone '{}'",
                        job.name, tz
                    ))
                    .with_source(e)
                })?;
            }
        }
        Ok(())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::{JobPriority, ScheduleKind};
    use std::io::Write;

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.worker_pool_size, 10);
        assert_eq!(config.default_timezone, "UTC");
        assert_eq!(config.history_retention_per_job, 1000);
        assert_eq!(config.default_base_retry_delay, Duration::from_secs(1));
        assert_eq!(config.default_max_retry_delay, Duration::from_secs(60));
        assert_eq!(config.dead_letter_capacity, 1000);
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
        assert!(config.validate().is_ok());
        assert_eq!(config.timezone().unwrap(), Tz::UTC);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = [
            SchedulerConfig {
                worker_pool_size: 0,
                ..Default::default()
            },
            SchedulerConfig {
                poll_interval: Duration::ZERO,
                ..Default::default()
            },
            SchedulerConfig {
                history_retention_per_job: 0,
                ..Default::default()
            },
            SchedulerConfig {
                default_timezone: "Mars/Olympus_Mons".to_string(),
                ..Default::default()
            },
            SchedulerConfig {
                default_base_retry_delay: Duration::from_secs(120),
                ..Default::default()
            },
        ];

        for config in cases {
            let err = config.validate().unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidConfiguration, "{config:?}");
        }
    }

    #[test]
    fn test_from_file_reads_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
poll_interval = "250ms"
worker_pool_size = 4
default_timezone = "Europe/Berlin"
default_max_retry_delay = "2m"

[telemetry.logging]
level = "debug"

[[bootstrap]]
name = "heartbeat"
schedule = {{ kind = "interval", every = "30s" }}
options = {{ priority = "high", max_retries = 0 }}

[[bootstrap]]
name = "nightly-report"
handler = "report"
timezone = "America/New_York"
schedule = {{ kind = "cron", expression = "0 2 * * *" }}
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let config = Config::from_file(path).unwrap();

        assert_eq!(config.scheduler.poll_interval, Duration::from_millis(250));
        assert_eq!(config.scheduler.worker_pool_size, 4);
        assert_eq!(config.scheduler.timezone().unwrap(), chrono_tz::Europe::Berlin);
        assert_eq!(config.scheduler.default_max_retry_delay, Duration::from_secs(120));
        assert_eq!(config.scheduler.history_retention_per_job, 1000);
        assert_eq!(config.telemetry.logging.level, "debug");

        assert_eq!(config.bootstrap.len(), 2);
        let heartbeat = &config.bootstrap[0];
        assert_eq!(heartbeat.handler, "log");
        assert_eq!(heartbeat.schedule, ScheduleSpec::interval(Duration::from_secs(30)));
        assert_eq!(heartbeat.options.priority, JobPriority::High);
        assert_eq!(heartbeat.options.max_retries, 0);

        let report = &config.bootstrap[1];
        assert_eq!(report.schedule.kind(), ScheduleKind::Cron);
        assert_eq!(report.timezone.as_deref(), Some("America/New_York"));
        assert_eq!(report.options, JobOptions::default());
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[scheduler]\nworker_pool_size = 0").unwrap();

        let err = Config::from_file(file.path().to_str().unwrap()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn test_bootstrap_timezone_validated() {
        let config = Config {
            bootstrap: vec![BootstrapJob {
                name: "bad".to_string(),
                schedule: ScheduleSpec::cron("* * * * *"),
                timezone: Some("Nowhere/Special".to_string()),
                options: JobOptions::default(),
                handler: "log".to_string(),
            }],
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().code(),
            ErrorCode::InvalidConfiguration
        );
    }

    #[test]
    fn test_derived_settings() {
        let config = SchedulerConfig {
            worker_pool_size: 3,
            shutdown_grace: Duration::from_secs(5),
            ..Default::default()
        };
        let worker = config.worker_config();
        assert_eq!(worker.pool_size, 3);
        assert_eq!(worker.shutdown_grace, Duration::from_secs(5));

        let policy = config.retry_policy();
        assert_eq!(policy.backoff_center(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_center(10), Duration::from_secs(60));
    }
}
