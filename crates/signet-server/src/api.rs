//! Shared API plumbing plus the health, stats, token and manual broadcast
//! handlers.

use crate::auth::{AuthError, Identity};
use crate::status_client::StatusUpdateError;
use crate::AppState;
use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use signet_changelog::partition_heads;
use signet_documents::{ContentError, WriteError};
use signet_search::SearchError;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unprocessable: {0}")]
    Unprocessable(String),
    #[error("upstream failure: {0}")]
    BadGateway(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => {
                tracing::error!("internal server error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<WriteError> for ApiError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            WriteError::VersionConflict { .. } => ApiError::Conflict(e.to_string()),
            WriteError::InvalidTransition { .. } => ApiError::Unprocessable(e.to_string()),
            WriteError::Validation(msg) => ApiError::BadRequest(msg),
            WriteError::UpstreamWriteFailure(_) => ApiError::BadGateway(e.to_string()),
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

impl From<ContentError> for ApiError {
    fn from(e: ContentError) -> Self {
        match e {
            ContentError::NotFound(_) => ApiError::NotFound(e.to_string()),
            ContentError::InvalidKey(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

impl From<SearchError> for ApiError {
    fn from(e: SearchError) -> Self {
        match e {
            SearchError::InvalidQuery(msg) => ApiError::BadRequest(msg),
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

impl From<StatusUpdateError> for ApiError {
    fn from(e: StatusUpdateError) -> Self {
        match e {
            StatusUpdateError::NotFound(msg) => ApiError::NotFound(msg),
            StatusUpdateError::VersionConflict(msg) => ApiError::Conflict(msg),
            StatusUpdateError::InvalidTransition(msg) => ApiError::Unprocessable(msg),
            StatusUpdateError::Transport(msg) => ApiError::BadGateway(msg),
            StatusUpdateError::Internal(msg) => ApiError::InternalServerError(msg),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Signing(msg) => ApiError::InternalServerError(msg),
            other => ApiError::Unauthorized(other.to_string()),
        }
    }
}

/// Runs blocking database work off the async executor.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::InternalServerError(format!("task join error: {}", e)))?
}

/// Parses an entity id path segment.
pub(crate) fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid id: {}", raw)))
}

pub(crate) fn pool_error(e: r2d2::Error) -> ApiError {
    ApiError::InternalServerError(format!("failed to get database connection: {}", e))
}

/// `GET /health/live`
pub async fn liveness() -> Json<Value> {
    Json(json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// `GET /health/ready`: the database answers and the consumers are running.
pub async fn readiness(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    run_blocking(move || {
        let conn = pool.get().map_err(|e| ApiError::ServiceUnavailable(e.to_string()))?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| ApiError::ServiceUnavailable(e.to_string()))?;
        Ok(())
    })
    .await?;

    let consumers = match &state.pipeline {
        Some(p) if p.is_running() => "running",
        _ => "stopped",
    };
    Ok(Json(json!({
        "status": "ready",
        "database": "ok",
        "consumers": consumers,
        "total_connections": state.registry.total_connections(),
    })))
}

/// `GET /stats`
pub async fn stats(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    let heads = run_blocking(move || {
        let conn = pool.get().map_err(pool_error)?;
        partition_heads(&conn).map_err(|e| ApiError::InternalServerError(e.to_string()))
    })
    .await?;
    let log_heads: Vec<Value> = heads
        .into_iter()
        .map(|(partition, position)| json!({ "partition": partition, "position": position }))
        .collect();

    Ok(Json(json!({
        "total_connections": state.registry.total_connections(),
        "entities_with_subscribers": state.registry.entity_count(),
        "log_heads": log_heads,
        "pipeline": state.pipeline.as_ref().map(|p| p.snapshot()),
    })))
}

/// Request body for `POST /auth/token`.
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// `POST /auth/token`: issues a connection token. Only routed when
/// `auth.allow_token_issuance` is enabled.
pub async fn issue_token_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<TokenRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = payload.user_id.trim();
    if user_id.is_empty() {
        return Err(ApiError::BadRequest("user_id is required".to_string()));
    }
    let identity = Identity {
        user_id: user_id.to_string(),
        email: payload.email,
    };
    let (token, claims) = state.auth.issue(&identity)?;
    tracing::info!(user_id = %claims.sub, "issued connection token");

    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
        "expires_in": state.auth.ttl_secs(),
        "user_id": claims.sub,
        "email": claims.email,
    })))
}

/// `POST /broadcast/{entity_id}`: pushes an arbitrary message to the
/// entity's subscribers.
pub async fn manual_broadcast_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(entity_id): Path<String>,
    Json(message): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let entity_id = parse_id(&entity_id)?;
    let text = serde_json::to_string(&message)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let report = state.registry.deliver(entity_id, &text);
    tracing::info!(
        entity_id = %entity_id,
        recipients = report.delivered,
        dropped = report.dropped,
        "manual broadcast"
    );

    Ok(Json(json!({
        "status": "broadcasted",
        "entity_id": entity_id,
        "recipients": report.delivered,
    })))
}
