//! Tempo Server - job scheduling daemon.
//!
//! Reads its configuration from the file named by `TEMPO_CONFIG` (if set) and from
//! `TEMPO__*` environment variables, creates the configured bootstrap jobs and runs
//! until SIGINT or SIGTERM.

use anyhow::Context;

use tempo_core::{
    config::{BootstrapJob, Config},
    jobs::{parse_timezone, register_builtins, HandlerRegistry, JobManager, NewJob},
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = match std::env::var("TEMPO_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("failed to load configuration from {path}"))?,
        Err(_) => Config::load().context("failed to load configuration")?,
    };

    let telemetry = telemetry::init_telemetry(&config.telemetry)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        metrics_enabled = telemetry.metrics.is_enabled(),
        "Starting Tempo Server"
    );

    let handlers = HandlerRegistry::new();
    register_builtins(&handlers);

    let manager = JobManager::builder()
        .config(config.scheduler.clone())
        .handlers(handlers)
        .build()?;

    for job in &config.bootstrap {
        bootstrap(&manager, job)
            .await
            .with_context(|| format!("failed to create bootstrap job '{}'", job.name))?;
    }

    manager.start()?;
    shutdown_signal().await;

    let clean = manager.shutdown().await;
    let stats = manager.stats();
    tracing::info!(
        clean,
        executions = stats.executions_processed,
        dead_letters = stats.dead_letters,
        "Server shutdown complete"
    );

    Ok(())
}

async fn bootstrap(manager: &JobManager, job: &BootstrapJob) -> tempo_core::Result<()> {
    let timezone = match &job.timezone {
        Some(name) => parse_timezone(name)?,
        None => manager.config().timezone()?,
    };

    manager
        .schedule(NewJob {
            name: job.name.clone(),
            schedule: job.schedule.clone(),
            timezone,
            options: job.options.clone(),
            handler: job.handler.clone(),
        })
        .await?;
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
