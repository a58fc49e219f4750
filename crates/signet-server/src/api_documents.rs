//! Document API handlers. Every mutation goes through the write coordinator.

use crate::api::{parse_id, pool_error, run_blocking, ApiError};
use crate::AppState;
use axum::{
    extract::{Extension, Json, Path, Query},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use signet_documents::{get_document, list_documents, DocumentFilter, DocumentPatch, NewDocument};
use signet_types::{Document, DocumentStatus};
use std::sync::Arc;

const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Request body for `POST /documents`.
#[derive(Debug, Deserialize)]
pub struct CreateDocumentRequest {
    pub title: String,
    /// Document body. Omit to create a draft with no stored content.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub created_by: String,
}

/// Request body for `PATCH /documents/{id}`.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateDocumentRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<DocumentStatus>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

/// Query parameters for `GET /documents`.
#[derive(Debug, Deserialize)]
pub struct ListDocumentsParams {
    #[serde(default)]
    pub status: Option<DocumentStatus>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

/// Query parameters for `DELETE /documents/{id}`.
#[derive(Debug, Deserialize)]
pub struct DeleteDocumentParams {
    #[serde(default)]
    pub expected_version: Option<i64>,
}

/// Handler for `POST /documents`.
pub async fn create_document_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    let created_by = payload.created_by.trim().to_string();
    if created_by.is_empty() {
        return Err(ApiError::BadRequest("created_by is required".to_string()));
    }
    let new = NewDocument {
        title: payload.title,
        content: payload.content.map(String::into_bytes),
        content_type: payload
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        created_by,
    };

    let coordinator = state.coordinator.clone();
    let doc = run_blocking(move || Ok(coordinator.create_document(new)?)).await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

/// Handler for `GET /documents`.
pub async fn list_documents_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<ListDocumentsParams>,
) -> Result<Json<Vec<Document>>, ApiError> {
    if !(1..=1000).contains(&params.limit) {
        return Err(ApiError::BadRequest("limit must be between 1 and 1000".to_string()));
    }
    let filter = DocumentFilter {
        status: params.status,
        created_by: params.created_by,
        offset: params.skip.max(0),
        limit: Some(params.limit),
    };
    let pool = state.pool.clone();
    let docs = run_blocking(move || {
        let conn = pool.get().map_err(pool_error)?;
        Ok(list_documents(&conn, &filter)?)
    })
    .await?;
    Ok(Json(docs))
}

/// Handler for `GET /documents/{id}`.
pub async fn get_document_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Document>, ApiError> {
    let id = parse_id(&id)?;
    let pool = state.pool.clone();
    let doc = run_blocking(move || {
        let conn = pool.get().map_err(pool_error)?;
        Ok(get_document(&conn, id)?)
    })
    .await?;
    Ok(Json(doc))
}

/// Handler for `PATCH /documents/{id}`.
pub async fn update_document_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateDocumentRequest>,
) -> Result<Json<Document>, ApiError> {
    let id = parse_id(&id)?;
    let expected_version = payload.expected_version;
    let patch = DocumentPatch {
        title: payload.title,
        status: payload.status,
        content: payload.content.map(String::into_bytes),
        content_type: payload.content_type,
    };

    let coordinator = state.coordinator.clone();
    let doc =
        run_blocking(move || Ok(coordinator.update_document(id, patch, expected_version)?))
            .await?;
    Ok(Json(doc))
}

/// Handler for `DELETE /documents/{id}`. Returns the last image.
pub async fn delete_document_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<DeleteDocumentParams>,
) -> Result<Json<Document>, ApiError> {
    let id = parse_id(&id)?;
    let coordinator = state.coordinator.clone();
    let doc =
        run_blocking(move || Ok(coordinator.delete_document(id, params.expected_version)?))
            .await?;
    Ok(Json(doc))
}

/// Handler for `GET /documents/{id}/content`.
pub async fn get_document_content_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id)?;
    let coordinator = state.coordinator.clone();
    let (content_type, bytes) = run_blocking(move || {
        let conn = coordinator.pool().get().map_err(pool_error)?;
        let doc = get_document(&conn, id)?;
        drop(conn);
        let key = doc
            .content_reference
            .ok_or_else(|| ApiError::NotFound(format!("document {} has no content", id)))?;
        let bytes = coordinator.read_content(&key)?;
        Ok((doc.content_type, bytes))
    })
    .await?;

    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}
