//! Search API handlers over the projection.

use crate::api::{pool_error, run_blocking, ApiError};
use crate::AppState;
use axum::extract::{Extension, Json, Path, Query};
use serde::Deserialize;
use serde_json::{json, Value};
use signet_search::{aggregate, search, suggest, AggregationField, SearchQuery, SearchResults};
use std::sync::Arc;

const DEFAULT_SUGGESTIONS: usize = 5;

/// Query parameters for `GET /suggest`.
#[derive(Debug, Deserialize)]
pub struct SuggestParams {
    pub q: String,
    #[serde(default = "default_suggestions")]
    pub size: usize,
}

fn default_suggestions() -> usize {
    DEFAULT_SUGGESTIONS
}

/// Query parameters for `GET /aggregations/{field}`.
#[derive(Debug, Deserialize)]
pub struct AggregationParams {
    #[serde(default)]
    pub q: Option<String>,
}

/// Handler for `GET /search`.
pub async fn search_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResults>, ApiError> {
    if query.q.trim().is_empty() {
        return Err(ApiError::BadRequest("q is required".to_string()));
    }
    let pool = state.pool.clone();
    let results = run_blocking(move || {
        let conn = pool.get().map_err(pool_error)?;
        Ok(search(&conn, &query)?)
    })
    .await?;
    Ok(Json(results))
}

/// Handler for `GET /suggest`.
pub async fn suggest_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<SuggestParams>,
) -> Result<Json<Value>, ApiError> {
    let pool = state.pool.clone();
    let suggestions = run_blocking(move || {
        let conn = pool.get().map_err(pool_error)?;
        Ok(suggest(&conn, &params.q, params.size)?)
    })
    .await?;
    Ok(Json(json!({ "suggestions": suggestions })))
}

/// Handler for `GET /aggregations/{field}`.
pub async fn aggregations_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(field): Path<String>,
    Query(params): Query<AggregationParams>,
) -> Result<Json<Value>, ApiError> {
    let parsed: AggregationField = field.parse()?;
    let pool = state.pool.clone();
    let buckets = run_blocking(move || {
        let conn = pool.get().map_err(pool_error)?;
        Ok(aggregate(&conn, parsed, params.q.as_deref())?)
    })
    .await?;
    Ok(Json(json!({
        "field": field,
        "values": buckets,
    })))
}
