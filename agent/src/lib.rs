//! Configuration and local HTTP control API for the TillSync agent.

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tillsync_sync::realtime::WebSocketRealtimeConfig;
use tillsync_sync::remote::RestConfig;
use tillsync_sync::{
    ChannelStatus, HandshakeState, PullOutcome, PushAllReport, PushReport, RestoreReport,
    SyncConfig, SyncEngine, SyncError, SyncStatus,
};
use tillsync_types::{TenantId, UserId};

/// Agent configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Local database file.
    pub database: PathBuf,
    /// Port of the local HTTP API (bound to loopback).
    pub http_port: u16,
    pub remote: RestConfig,
    /// Realtime endpoint; realtime is disabled when absent.
    pub realtime: Option<WebSocketRealtimeConfig>,
    pub sync: SyncConfig,
    /// Signed-in user. When set, the tenant binding is verified at startup.
    pub user_id: Option<UserId>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("tillsync.db"),
            http_port: 4780,
            remote: RestConfig::default(),
            realtime: None,
            sync: SyncConfig::default(),
            user_id: None,
        }
    }
}

impl AgentConfig {
    /// Reads a JSON configuration file. Missing keys take their defaults.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

// ── HTTP API ─────────────────────────────────────────────────────

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct StatusResponse {
    pub status: SyncStatus,
    pub handshake: HandshakeState,
    pub tenant: Option<TenantId>,
    pub syncing: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    pub table: Option<String>,
}

/// Query of operations that overwrite local tables.
#[derive(Deserialize, Debug, Default)]
pub struct ConfirmQuery {
    #[serde(default)]
    pub confirm: bool,
}

/// An API failure rendered as an HTTP response.
pub enum ApiError {
    Sync(SyncError),
    /// A destructive operation was requested without `confirm=true`.
    ConfirmationRequired(&'static str),
}

impl From<SyncError> for ApiError {
    fn from(error: SyncError) -> Self {
        Self::Sync(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        let error = match self {
            ApiError::Sync(error) => error,
            ApiError::ConfirmationRequired(_) => return StatusCode::PRECONDITION_REQUIRED,
        };
        match error {
            SyncError::AlreadySyncing => StatusCode::CONFLICT,
            SyncError::UnknownTable(_) => StatusCode::NOT_FOUND,
            SyncError::NoTenant | SyncError::TenantBinding(_) | SyncError::TenantMismatch { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            e if e.is_connectivity() => StatusCode::SERVICE_UNAVAILABLE,
            e if e.status_code().is_some() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::Sync(error) => ErrorResponse {
                error: error.to_string(),
                table: error.table().map(str::to_string),
            },
            ApiError::ConfirmationRequired(operation) => ErrorResponse {
                error: format!("{operation} overwrites local data; repeat with confirm=true"),
                table: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn status_handler(State(engine): State<Arc<SyncEngine>>) -> ApiResult<StatusResponse> {
    Ok(Json(StatusResponse {
        status: engine.status(),
        handshake: engine.handshake_state().await,
        tenant: engine.tenant().await?,
        syncing: engine.is_syncing(),
    }))
}

async fn push_all_handler(State(engine): State<Arc<SyncEngine>>) -> ApiResult<PushAllReport> {
    let report = engine.push_all().await?.ok_or(SyncError::NoTenant)?;
    Ok(Json(report))
}

async fn push_table_handler(
    State(engine): State<Arc<SyncEngine>>,
    Path(table): Path<String>,
) -> ApiResult<PushReport> {
    let report = engine.push_table(&table).await?.ok_or(SyncError::NoTenant)?;
    Ok(Json(report))
}

async fn restore_handler(
    State(engine): State<Arc<SyncEngine>>,
    Query(query): Query<ConfirmQuery>,
) -> ApiResult<RestoreReport> {
    if !query.confirm {
        return Err(ApiError::ConfirmationRequired("restore"));
    }
    let report = engine
        .restore_from_cloud()
        .await?
        .ok_or(SyncError::NoTenant)?;
    Ok(Json(report))
}

async fn pull_table_handler(
    State(engine): State<Arc<SyncEngine>>,
    Path(table): Path<String>,
    Query(query): Query<ConfirmQuery>,
) -> ApiResult<PullOutcome> {
    if engine.registry().get(&table).is_none() {
        return Err(SyncError::UnknownTable(table).into());
    }
    if !query.confirm {
        return Err(ApiError::ConfirmationRequired("pull"));
    }
    match engine.pull_table(&table).await? {
        PullOutcome::NoTenant { .. } => Err(SyncError::NoTenant.into()),
        outcome => Ok(Json(outcome)),
    }
}

async fn table_changed_handler(
    State(engine): State<Arc<SyncEngine>>,
    Path(table): Path<String>,
) -> Result<StatusCode, ApiError> {
    if engine.registry().get(&table).is_none() {
        return Err(SyncError::UnknownTable(table).into());
    }
    engine.trigger_change(&table);
    Ok(StatusCode::ACCEPTED)
}

async fn connectivity_handler(State(engine): State<Arc<SyncEngine>>) -> StatusCode {
    engine.connectivity_restored().await;
    StatusCode::ACCEPTED
}

async fn channels_handler(State(engine): State<Arc<SyncEngine>>) -> Json<Vec<ChannelStatus>> {
    Json(engine.channels().await)
}

/// Build the HTTP API router over the given engine.
pub fn build_router(engine: Arc<SyncEngine>) -> Router {
    Router::new()
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/push", post(push_all_handler))
        .route("/api/v1/push/{table}", post(push_table_handler))
        .route("/api/v1/restore", post(restore_handler))
        .route("/api/v1/pull/{table}", post(pull_table_handler))
        .route("/api/v1/tables/{table}/changed", post(table_changed_handler))
        .route("/api/v1/connectivity", post(connectivity_handler))
        .route("/api/v1/channels", get(channels_handler))
        .with_state(engine)
}
