//! Shared setup for the server integration tests.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use signet_changelog::LogHead;
use signet_db::{create_pool, run_migrations, DbRuntimeSettings};
use signet_documents::{FsContentStore, WriteCoordinator, WriteSettings};
use signet_server::auth::{Identity, TokenAuthority};
use signet_server::config::{ChangeLogConfig, ConnectionSettings};
use signet_server::pipeline::Pipeline;
use signet_server::registry::ConnectionRegistry;
use signet_server::status_client::StatusClient;
use signet_server::{app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

pub const SECRET: &[u8] = b"integration-secret";

pub struct TestApp {
    pub _dir: tempfile::TempDir,
    pub state: AppState,
    pub coordinator: Arc<WriteCoordinator>,
    pub registry: ConnectionRegistry,
    pub auth: Arc<TokenAuthority>,
    pub pipeline: Option<Pipeline>,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct Options {
    pub pipeline: bool,
    pub allow_token_issuance: bool,
    pub admin: bool,
    pub connection: ConnectionSettings,
}

pub fn setup(options: Options) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("signet.db");
    let pool = create_pool(db_path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();

    let changelog = ChangeLogConfig {
        partitions: 2,
        poll_interval_ms: 25,
        ..ChangeLogConfig::default()
    };
    let head = LogHead::new();
    let coordinator = Arc::new(WriteCoordinator::new(
        pool.clone(),
        Arc::new(FsContentStore::new(dir.path().join("content"))),
        head.clone(),
        WriteSettings {
            partitions: changelog.partitions,
            ..WriteSettings::default()
        },
    ));

    let registry = ConnectionRegistry::new();
    let cancel = CancellationToken::new();
    let pipeline = options.pipeline.then(|| {
        Pipeline::start(
            pool.clone(),
            head,
            registry.clone(),
            &changelog,
            cancel.clone(),
        )
    });

    let auth = Arc::new(TokenAuthority::new(SECRET, 3600));
    let state = AppState {
        pool,
        coordinator: Arc::clone(&coordinator),
        registry: registry.clone(),
        auth: Arc::clone(&auth),
        allow_token_issuance: options.allow_token_issuance,
        admin_enabled: options.admin,
        status_client: StatusClient::Local(Arc::clone(&coordinator)),
        connection: options.connection,
        pipeline: pipeline.as_ref().map(Pipeline::status),
    };

    TestApp {
        _dir: dir,
        state,
        coordinator,
        registry,
        auth,
        pipeline,
        cancel,
    }
}

impl TestApp {
    pub fn router(&self) -> Router {
        app(self.state.clone())
    }

    /// Serves the app on an ephemeral port.
    pub async fn serve(&self) -> SocketAddr {
        let router = self.router();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    pub fn token(&self, user_id: &str) -> String {
        let identity = Identity {
            user_id: user_id.to_string(),
            email: Some(format!("{user_id}@example.com")),
        };
        self.auth.issue(&identity).unwrap().0
    }

    pub fn expired_token(&self, user_id: &str) -> String {
        let identity = Identity {
            user_id: user_id.to_string(),
            email: None,
        };
        let past = chrono::Utc::now().timestamp() - 60;
        self.auth.issue_with_expiry(&identity, past).unwrap().0
    }

    /// Sends one request through the router and returns status plus JSON
    /// body (`Value::Null` for an empty body).
    pub async fn request(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, json)
    }
}

/// Polls `check` until it returns `Some`, failing after about two seconds.
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(value) = check().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
