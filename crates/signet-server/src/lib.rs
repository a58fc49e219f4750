//! Signet server: HTTP API, live connections and the change-log consumers.

pub mod api;
pub mod api_documents;
pub mod api_internal;
pub mod api_search;
pub mod api_signatures;
pub mod api_ws;
pub mod auth;
pub mod broadcaster;
pub mod config;
pub mod pipeline;
pub mod registry;
pub mod status_client;

use auth::TokenAuthority;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use config::ConnectionSettings;
use pipeline::PipelineStatus;
use registry::ConnectionRegistry;
use signet_db::DbPool;
use signet_documents::WriteCoordinator;
use status_client::StatusClient;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Serializes every entity mutation with its change-log record.
    pub coordinator: Arc<WriteCoordinator>,
    /// Live connections by entity id.
    pub registry: ConnectionRegistry,
    /// Connection token issuer and validator.
    pub auth: Arc<TokenAuthority>,
    /// Whether `POST /auth/token` is routed.
    pub allow_token_issuance: bool,
    /// Whether the operator routes (manual broadcast, resnapshot, rewind)
    /// are routed.
    pub admin_enabled: bool,
    /// Transport used by the signature flow to mark documents signed.
    pub status_client: StatusClient,
    /// Per-connection queue size and timers.
    pub connection: ConnectionSettings,
    /// Consumer counters, when the pipeline runs in this process.
    pub pipeline: Option<PipelineStatus>,
}

/// Maximum request body size. Sized for document content plus JSON framing.
const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health/live", get(api::liveness))
        .route("/health/ready", get(api::readiness))
        .route("/stats", get(api::stats))
        .route(
            "/documents",
            post(api_documents::create_document_handler).get(api_documents::list_documents_handler),
        )
        .route(
            "/documents/{id}",
            get(api_documents::get_document_handler)
                .patch(api_documents::update_document_handler)
                .delete(api_documents::delete_document_handler),
        )
        .route(
            "/documents/{id}/content",
            get(api_documents::get_document_content_handler),
        )
        .route(
            "/documents/{id}/signatures",
            get(api_signatures::document_signatures_handler),
        )
        .route(
            "/signatures",
            post(api_signatures::create_signature_handler)
                .get(api_signatures::list_signatures_handler),
        )
        .route(
            "/signatures/{id}",
            get(api_signatures::get_signature_handler),
        )
        .route("/search", get(api_search::search_handler))
        .route("/suggest", get(api_search::suggest_handler))
        .route(
            "/aggregations/{field}",
            get(api_search::aggregations_handler),
        )
        .route(
            "/internal/documents/{id}/status",
            post(api_internal::update_status_handler),
        )
        .route("/ws/{entity_id}", get(api_ws::ws_handler));

    if state.allow_token_issuance {
        tracing::info!("token issuance enabled at POST /auth/token");
        router = router.route("/auth/token", post(api::issue_token_handler));
    }

    if state.admin_enabled {
        tracing::warn!("operator routes enabled without authentication");
        router = router
            .route(
                "/internal/resnapshot",
                post(api_internal::resnapshot_handler),
            )
            .route(
                "/internal/consumers/{group}/rewind",
                post(api_internal::rewind_handler),
            )
            .route(
                "/broadcast/{entity_id}",
                post(api::manual_broadcast_handler),
            );
    }

    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
