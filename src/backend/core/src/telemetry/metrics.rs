//! Prometheus metrics for dispatch, execution and errors.
//!
//! Instrumented code records through the `metrics` facade directly; this module
//! only installs the recorder and describes the metric names.
//!
//! | Metric | Kind | Labels |
//! |---|---|---|
//! | `tempo_jobs_dispatched_total` | counter | `priority` |
//! | `tempo_dispatch_skipped_total` | counter | `reason` |
//! | `tempo_executions_total` | counter | `outcome` |
//! | `tempo_execution_duration_seconds` | histogram | |
//! | `tempo_retries_total` | counter | |
//! | `tempo_dead_letters_total` | counter | |
//! | `tempo_queue_depth` | gauge | |
//! | `tempo_active_executions` | gauge | |
//! | `tempo_errors_total` | counter | `code`, `category`, `severity` |

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address for the Prometheus scrape endpoint; `None` keeps metrics in-process
    #[serde(default)]
    pub listen_address: Option<String>,

    /// Histogram buckets for execution durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Labels added to every metric
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen_address: None,
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0,
    ]
}

/// Access to the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it. Recorded values are discarded.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the global Prometheus recorder.
///
/// With a `listen_address` the scrape endpoint is served on the current Tokio runtime.
///
/// # Errors
///
/// Returns an error for invalid buckets or addresses, or when a recorder is
/// already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = match &config.listen_address {
        Some(address) => {
            let address: SocketAddr = address.parse()?;
            let (recorder, exporter) = builder.with_http_listener(address).build()?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|_| anyhow::anyhow!("a metrics recorder is already installed"))?;
            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::error!(error = ?e, "Prometheus exporter stopped");
                }
            });
            handle
        }
        None => builder.install_recorder()?,
    };

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        listen_address = ?config.listen_address,
        "Metrics initialized"
    );

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    // Dispatch
    describe_counter!(
        "tempo_jobs_dispatched_total",
        "Due occurrences pushed onto the dispatch queue"
    );
    describe_counter!(
        "tempo_dispatch_skipped_total",
        "Due occurrences skipped, by reason"
    );
    describe_gauge!("tempo_queue_depth", "Items waiting in the dispatch queue");

    // Execution
    describe_counter!("tempo_executions_total", "Execution attempts by outcome");
    describe_histogram!(
        "tempo_execution_duration_seconds",
        Unit::Seconds,
        "Execution attempt duration"
    );
    describe_gauge!("tempo_active_executions", "Attempts currently running");
    describe_counter!("tempo_retries_total", "Retries scheduled after failed attempts");
    describe_counter!(
        "tempo_dead_letters_total",
        "Executions moved to the dead-letter queue"
    );

    // Errors
    describe_counter!("tempo_errors_total", "Errors raised, by code");
}
