//! Observability: logging initialization, the Prometheus exporter, and the
//! helpers that record cairn's counters and gauges.

use crate::config::ObservabilityConfig;
use crate::error::{CairnError, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(normalize_level(&config.log_level)));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| CairnError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| CairnError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// The CLI accepts logrus-style level names; EnvFilter wants `warn`.
fn normalize_level(level: &str) -> &str {
    match level {
        "warning" => "warn",
        other => other,
    }
}

/// Run the Prometheus metrics server.
pub async fn run_metrics_server(config: ObservabilityConfig) -> Result<()> {
    let builder = PrometheusBuilder::new();

    let handle = builder
        .install_recorder()
        .map_err(|e| CairnError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| CairnError::Network(e.to_string()))?;

    Ok(())
}

/// Record the outcome of one backup timer fire.
pub fn record_backup_task(backup: &str, status: &str) {
    counter!("backup_tasks_total", "backup" => backup.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record a backup trigger outcome.
pub fn record_backup_trigger(backup: &str, status: &str) {
    counter!("backup_trigger_total", "backup" => backup.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record a materialized create workflow outcome.
pub fn record_workflow(backup: &str, status: &str) {
    counter!("workflow_total", "backup" => backup.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record a tagging pass outcome.
pub fn record_backup_tag(backup: &str, status: &str) {
    counter!("backup_tag_total", "backup" => backup.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record an overall backup warning.
pub fn record_backup_warn(backup: &str, status: &str) {
    counter!("backup_warn_total", "backup" => backup.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record one retention task run.
pub fn record_retention_task() {
    counter!("retention_tasks_total").increment(1);
}

/// Record a retention delete outcome.
pub fn record_retention_delete(backup: &str, status: &str) {
    counter!("retention_backup_delete_total", "backup" => backup.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record a relaunched delete workflow.
pub fn record_retention_delete_retry() {
    counter!("retention_backup_delete_retries_total").increment(1);
}

/// Publish the size of the last successful backup.
pub fn set_last_backup_size(backup: &str, size_mb: f64) {
    gauge!("backup_last_size_mbytes", "backup" => backup.to_string()).set(size_mb);
}

/// Publish the duration of the last successful backup.
pub fn set_last_backup_time(backup: &str, seconds: f64) {
    gauge!("backup_last_time_seconds", "backup" => backup.to_string()).set(seconds);
}
