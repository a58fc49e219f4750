//! Signature API handlers.

use crate::api::{parse_id, pool_error, run_blocking, ApiError};
use crate::status_client::StatusClient;
use crate::AppState;
use axum::{
    extract::{Extension, Json, Path, Query},
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use signet_documents::{get_signature, list_signatures, list_signatures_for_document, NewSignature};
use signet_types::{DocumentStatus, Signature, StatusUpdateRequest};
use std::sync::Arc;
use uuid::Uuid;

/// Request body for `POST /signatures`.
#[derive(Debug, Deserialize)]
pub struct CreateSignatureRequest {
    pub document_id: Uuid,
    pub signer_email: String,
    pub signer_name: String,
    /// Signature image payload, stored in the content store.
    #[serde(default)]
    pub signature_data: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

/// Query parameters for `GET /signatures`.
#[derive(Debug, Deserialize)]
pub struct ListSignaturesParams {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Marks the signed document `signed`. Failures are logged, never surfaced
/// to the signer.
async fn mark_document_signed(client: StatusClient, document_id: Uuid) {
    let request = StatusUpdateRequest {
        entity_id: document_id,
        new_status: DocumentStatus::Signed,
        expected_version: None,
    };
    match client.update_status(request).await {
        Ok(response) => tracing::info!(
            document_id = %document_id,
            version = response.version,
            "document marked signed"
        ),
        Err(e) => tracing::warn!(
            document_id = %document_id,
            "failed to mark document signed: {}",
            e
        ),
    }
}

/// Handler for `POST /signatures`.
///
/// Commits the signature, then asks the document side to move the document
/// to `signed` in the background.
pub async fn create_signature_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateSignatureRequest>,
) -> Result<(StatusCode, Json<Signature>), ApiError> {
    let new = NewSignature {
        document_id: payload.document_id,
        signer_email: payload.signer_email,
        signer_name: payload.signer_name,
        signature_data: payload.signature_data.map(String::into_bytes),
        ip_address: payload.ip_address.or_else(|| forwarded_for(&headers)),
    };

    let coordinator = state.coordinator.clone();
    let signature = run_blocking(move || Ok(coordinator.create_signature(new)?)).await?;

    tokio::spawn(mark_document_signed(
        state.status_client.clone(),
        signature.document_id,
    ));

    Ok((StatusCode::CREATED, Json(signature)))
}

/// Handler for `GET /signatures`.
pub async fn list_signatures_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<ListSignaturesParams>,
) -> Result<Json<Vec<Signature>>, ApiError> {
    if !(1..=1000).contains(&params.limit) {
        return Err(ApiError::BadRequest("limit must be between 1 and 1000".to_string()));
    }
    let pool = state.pool.clone();
    let signatures = run_blocking(move || {
        let conn = pool.get().map_err(pool_error)?;
        Ok(list_signatures(&conn, params.skip, params.limit)?)
    })
    .await?;
    Ok(Json(signatures))
}

/// Handler for `GET /signatures/{id}`.
pub async fn get_signature_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Signature>, ApiError> {
    let id = parse_id(&id)?;
    let pool = state.pool.clone();
    let signature = run_blocking(move || {
        let conn = pool.get().map_err(pool_error)?;
        Ok(get_signature(&conn, id)?)
    })
    .await?;
    Ok(Json(signature))
}

/// Handler for `GET /documents/{id}/signatures`. A document with no
/// signatures is a 404.
pub async fn document_signatures_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Signature>>, ApiError> {
    let id = parse_id(&id)?;
    let pool = state.pool.clone();
    let signatures = run_blocking(move || {
        let conn = pool.get().map_err(pool_error)?;
        Ok(list_signatures_for_document(&conn, id)?)
    })
    .await?;
    if signatures.is_empty() {
        return Err(ApiError::NotFound(format!(
            "no signatures found for document {}",
            id
        )));
    }
    Ok(Json(signatures))
}
