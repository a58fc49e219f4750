//! Internal endpoints: the document status-update call plus log replay
//! controls.

use crate::api::{parse_id, pool_error, run_blocking, ApiError};
use crate::pipeline::{BROADCAST_GROUP, SEARCH_GROUP};
use crate::AppState;
use axum::extract::{Extension, Json, Path};
use serde::Deserialize;
use serde_json::{json, Value};
use signet_changelog::rewind_cursor;
use signet_types::{DocumentStatus, StatusUpdateRequest, StatusUpdateResponse};
use std::sync::Arc;
use uuid::Uuid;

/// Request body for `POST /internal/documents/{id}/status`.
#[derive(Debug, Deserialize)]
pub struct StatusUpdateBody {
    /// Must match the path id when present.
    #[serde(default)]
    pub entity_id: Option<Uuid>,
    pub new_status: DocumentStatus,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

/// Handler for `POST /internal/documents/{id}/status`.
///
/// 404 for an unknown document, 409 on a version mismatch, 422 when the
/// lifecycle forbids the move. Re-requesting the current status succeeds
/// without a new version.
pub async fn update_status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<StatusUpdateBody>,
) -> Result<Json<StatusUpdateResponse>, ApiError> {
    let id = parse_id(&id)?;
    if body.entity_id.is_some_and(|entity_id| entity_id != id) {
        return Err(ApiError::BadRequest(
            "entity_id does not match the path".to_string(),
        ));
    }
    let request = StatusUpdateRequest {
        entity_id: id,
        new_status: body.new_status,
        expected_version: body.expected_version,
    };

    let coordinator = state.coordinator.clone();
    let doc = run_blocking(move || Ok(coordinator.update_status(&request)?)).await?;
    tracing::info!(
        document_id = %doc.id,
        status = %doc.status,
        version = doc.version,
        "status update applied"
    );
    Ok(Json(StatusUpdateResponse::from(doc)))
}

/// Handler for `POST /internal/resnapshot`: appends a snapshot record for
/// every document so consumers rebuild their state from the log.
pub async fn resnapshot_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let coordinator = state.coordinator.clone();
    let records = run_blocking(move || Ok(coordinator.resnapshot_documents()?)).await?;
    tracing::info!(records, "appended document snapshots");
    Ok(Json(json!({ "records": records })))
}

/// Request body for `POST /internal/consumers/{group}/rewind`.
#[derive(Debug, Default, Deserialize)]
pub struct RewindBody {
    #[serde(default)]
    pub position: i64,
}

/// Handler for `POST /internal/consumers/{group}/rewind`: moves the group's
/// cursor on every partition back to `position` (default 0). A batch
/// committing concurrently may win over the rewind.
pub async fn rewind_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(group): Path<String>,
    Json(body): Json<RewindBody>,
) -> Result<Json<Value>, ApiError> {
    if group != SEARCH_GROUP && group != BROADCAST_GROUP {
        return Err(ApiError::NotFound(format!("unknown consumer group: {}", group)));
    }
    if body.position < 0 {
        return Err(ApiError::BadRequest("position must be non-negative".to_string()));
    }
    let partitions = state.coordinator.settings().partitions;
    let pool = state.pool.clone();
    let group_name = group.clone();
    run_blocking(move || {
        let conn = pool.get().map_err(pool_error)?;
        for partition in 0..partitions {
            rewind_cursor(&conn, &group_name, partition, body.position)
                .map_err(|e| ApiError::InternalServerError(e.to_string()))?;
        }
        Ok(())
    })
    .await?;
    Ok(Json(json!({
        "group": group,
        "partitions": partitions,
        "position": body.position,
    })))
}
