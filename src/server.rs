//! HTTP API: health plus CRUD over backup specs.
//!
//! Mutating handlers reconcile the scheduler afterwards so a spec edit takes
//! effect without waiting for the periodic refresh.

use crate::engine::Engine;
use crate::error::{CairnError, Result};
use crate::model::{BackupSpec, MaterializedStatus, RetentionRule, TagLevel};
use crate::scheduling::{Schedule, Scheduler};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub scheduler: Arc<Scheduler>,
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/backup", get(list_specs).post(create_spec))
        .route(
            "/backup/:name",
            get(get_spec).put(update_spec).delete(delete_spec),
        )
        .route("/backup/:name/materialized", get(list_materialized))
        .with_state(state)
}

/// Serve the API until the process shuts down.
pub async fn run_api_server(bind_addr: SocketAddr, state: AppState) -> Result<()> {
    let app = build_router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| CairnError::Network(e.to_string()))?;
    Ok(())
}

struct ApiError(CairnError);

impl From<CairnError> for ApiError {
    fn from(e: CairnError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CairnError::NotFound(_) => StatusCode::NOT_FOUND,
            CairnError::AlreadyExists(_) | CairnError::InvalidState(_) => StatusCode::CONFLICT,
            CairnError::InvalidArgument(_) | CairnError::InvalidConfig { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct ListSpecsParams {
    enabled: Option<bool>,
}

async fn list_specs(
    State(state): State<AppState>,
    Query(params): Query<ListSpecsParams>,
) -> std::result::Result<Json<Vec<BackupSpec>>, ApiError> {
    let specs = state.engine.store().list_specs(params.enabled).await?;
    Ok(Json(specs))
}

fn default_enabled() -> bool {
    true
}

fn default_retention_zero() -> String {
    "0@L".to_string()
}

fn default_retention_daily() -> String {
    "4@L".to_string()
}

fn default_retention_weekly() -> String {
    "4@L".to_string()
}

fn default_retention_monthly() -> String {
    "3@L".to_string()
}

fn default_retention_yearly() -> String {
    "2@L".to_string()
}

fn default_timeout_seconds() -> u64 {
    7200
}

#[derive(Deserialize)]
struct CreateSpecRequest {
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    backup_cron_string: String,
    from_date: Option<DateTime<Utc>>,
    to_date: Option<DateTime<Utc>>,
    #[serde(default = "default_retention_zero")]
    retention_minutely: String,
    #[serde(default = "default_retention_zero")]
    retention_hourly: String,
    #[serde(default = "default_retention_daily")]
    retention_daily: String,
    #[serde(default = "default_retention_weekly")]
    retention_weekly: String,
    #[serde(default = "default_retention_monthly")]
    retention_monthly: String,
    #[serde(default = "default_retention_yearly")]
    retention_yearly: String,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
    worker_config: Option<String>,
}

fn validate_spec(spec: &BackupSpec) -> Result<()> {
    if spec.name.is_empty() {
        return Err(CairnError::InvalidArgument("backup name cannot be empty".to_string()));
    }
    Schedule::parse(&spec.backup_cron_string).map_err(|e| {
        CairnError::InvalidArgument(format!(
            "invalid cron expression '{}': {}",
            spec.backup_cron_string, e
        ))
    })?;
    for level in TagLevel::ALL {
        spec.retention_string(level).parse::<RetentionRule>()?;
    }
    Ok(())
}

async fn create_spec(
    State(state): State<AppState>,
    Json(request): Json<CreateSpecRequest>,
) -> std::result::Result<(StatusCode, Json<BackupSpec>), ApiError> {
    let spec = BackupSpec {
        name: request.name,
        enabled: request.enabled,
        running_create_workflow: None,
        from_date: request.from_date,
        to_date: request.to_date,
        backup_cron_string: request.backup_cron_string,
        retention_minutely: request.retention_minutely,
        retention_hourly: request.retention_hourly,
        retention_daily: request.retention_daily,
        retention_weekly: request.retention_weekly,
        retention_monthly: request.retention_monthly,
        retention_yearly: request.retention_yearly,
        timeout_seconds: request.timeout_seconds,
        worker_config: request.worker_config,
        last_update: Utc::now(),
    };
    validate_spec(&spec)?;
    state.engine.store().create_spec(spec.clone()).await?;
    info!(backup = %spec.name, "backup spec created");
    reconcile(&state).await;
    Ok((StatusCode::CREATED, Json(spec)))
}

async fn get_spec(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> std::result::Result<Json<BackupSpec>, ApiError> {
    let spec = state.engine.store().get_spec(&name).await?;
    Ok(Json(spec))
}

#[derive(Deserialize)]
struct UpdateSpecRequest {
    enabled: Option<bool>,
    backup_cron_string: Option<String>,
    from_date: Option<DateTime<Utc>>,
    to_date: Option<DateTime<Utc>>,
    retention_minutely: Option<String>,
    retention_hourly: Option<String>,
    retention_daily: Option<String>,
    retention_weekly: Option<String>,
    retention_monthly: Option<String>,
    retention_yearly: Option<String>,
    timeout_seconds: Option<u64>,
    worker_config: Option<String>,
}

async fn update_spec(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<UpdateSpecRequest>,
) -> std::result::Result<Json<BackupSpec>, ApiError> {
    let mut spec = state.engine.store().get_spec(&name).await?;

    if let Some(enabled) = request.enabled {
        spec.enabled = enabled;
    }
    if let Some(cron) = request.backup_cron_string {
        spec.backup_cron_string = cron;
    }
    if request.from_date.is_some() {
        spec.from_date = request.from_date;
    }
    if request.to_date.is_some() {
        spec.to_date = request.to_date;
    }
    if let Some(value) = request.retention_minutely {
        spec.retention_minutely = value;
    }
    if let Some(value) = request.retention_hourly {
        spec.retention_hourly = value;
    }
    if let Some(value) = request.retention_daily {
        spec.retention_daily = value;
    }
    if let Some(value) = request.retention_weekly {
        spec.retention_weekly = value;
    }
    if let Some(value) = request.retention_monthly {
        spec.retention_monthly = value;
    }
    if let Some(value) = request.retention_yearly {
        spec.retention_yearly = value;
    }
    if let Some(timeout) = request.timeout_seconds {
        spec.timeout_seconds = timeout;
    }
    if request.worker_config.is_some() {
        spec.worker_config = request.worker_config;
    }
    spec.last_update = Utc::now();

    validate_spec(&spec)?;
    state.engine.store().update_spec(spec.clone()).await?;
    info!(backup = %spec.name, "backup spec updated");
    reconcile(&state).await;
    Ok(Json(spec))
}

async fn delete_spec(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    state.engine.store().delete_spec(&name).await?;
    info!(backup = %name, "backup spec deleted");
    reconcile(&state).await;
    Ok(StatusCode::NO_CONTENT)
}

fn default_materialized_limit() -> u32 {
    50
}

#[derive(Deserialize)]
struct ListMaterializedParams {
    status: Option<String>,
    #[serde(default = "default_materialized_limit")]
    limit: u32,
    after: Option<String>,
}

async fn list_materialized(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<ListMaterializedParams>,
) -> std::result::Result<Json<Vec<crate::model::MaterializedBackup>>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<MaterializedStatus>)
        .transpose()
        .map_err(|_| {
            CairnError::InvalidArgument(format!(
                "unknown status filter '{}'",
                params.status.as_deref().unwrap_or_default()
            ))
        })?;
    let backups = state
        .engine
        .store()
        .list_materialized(&name, params.limit, params.after.as_deref(), status, false)
        .await?;
    Ok(Json(backups))
}

async fn reconcile(state: &AppState) {
    if let Err(e) = state.scheduler.reconcile().await {
        error!(error = %e, "scheduler reconcile after spec change failed");
    }
}
