//! Signet server binary.
//!
//! Starts the HTTP and live-connection server, the change-log consumers, and
//! shuts them down in order on SIGTERM/SIGINT: stop accepting requests,
//! close live connections, then stop the consumers.

use signet_changelog::LogHead;
use signet_documents::{FsContentStore, WriteCoordinator, WriteSettings};
use signet_server::auth::TokenAuthority;
use signet_server::config::{self, ConnectionSettings};
use signet_server::pipeline::Pipeline;
use signet_server::registry::{CloseReason, ConnectionRegistry};
use signet_server::status_client::StatusClient;
use signet_server::{app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("SIGNET_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let pool = signet_db::create_pool(
        &config.database.path,
        signet_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool; check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = signet_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    std::fs::create_dir_all(&config.content.dir)
        .expect("failed to create content directory; check content.dir in config");

    let head = LogHead::new();
    let coordinator = Arc::new(WriteCoordinator::new(
        pool.clone(),
        Arc::new(FsContentStore::new(&config.content.dir)),
        head.clone(),
        WriteSettings {
            partitions: config.changelog.partitions,
            max_content_bytes: config.content.max_content_bytes,
            max_signature_bytes: config.content.max_signature_bytes,
        },
    ));

    let status_client = StatusClient::from_config(&config.status_rpc, Arc::clone(&coordinator))
        .expect("failed to build status-update client; check status_rpc in config");

    let registry = ConnectionRegistry::new();
    let cancel = CancellationToken::new();
    let pipeline = Pipeline::start(
        pool.clone(),
        head,
        registry.clone(),
        &config.changelog,
        cancel.clone(),
    );

    let state = AppState {
        pool,
        coordinator,
        registry: registry.clone(),
        auth: Arc::new(TokenAuthority::from_config(&config.auth)),
        allow_token_issuance: config.auth.allow_token_issuance,
        admin_enabled: config.admin.enabled,
        status_client,
        connection: ConnectionSettings::from(&config.websocket),
        pipeline: Some(pipeline.status()),
    };

    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, partitions = config.changelog.partitions, "starting signet server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    let shutdown_registry = registry.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        shutdown_registry.close_all(CloseReason::SHUTDOWN);
    })
    .await
    .expect("server error");

    pipeline.shutdown().await;
    registry.close_all(CloseReason::SHUTDOWN);

    tracing::info!("signet server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
