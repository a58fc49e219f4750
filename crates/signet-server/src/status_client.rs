//! Client side of the document status-update call.
//!
//! The signature flow marks a document `signed` through this client. In a
//! single-process deployment it calls the write coordinator directly; when
//! documents live in another process it posts to that process's
//! `/internal/documents/{id}/status` endpoint.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use signet_documents::{WriteCoordinator, WriteError};
use signet_types::{StatusUpdateRequest, StatusUpdateResponse};

use crate::config::{StatusRpcConfig, StatusRpcMode};

/// Typed failures of a status update.
#[derive(Debug, thiserror::Error)]
pub enum StatusUpdateError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict: {0}")]
    VersionConflict(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("status update transport failed: {0}")]
    Transport(String),

    #[error("status update failed: {0}")]
    Internal(String),
}

impl From<WriteError> for StatusUpdateError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::NotFound { .. } => Self::NotFound(e.to_string()),
            WriteError::VersionConflict { .. } => Self::VersionConflict(e.to_string()),
            WriteError::InvalidTransition { .. } => Self::InvalidTransition(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Either an in-process or a remote status-update transport.
#[derive(Clone)]
pub enum StatusClient {
    Local(Arc<WriteCoordinator>),
    Http {
        client: reqwest::Client,
        base_url: String,
    },
}

impl StatusClient {
    /// Selects the transport from configuration.
    pub fn from_config(
        config: &StatusRpcConfig,
        coordinator: Arc<WriteCoordinator>,
    ) -> Result<Self, StatusUpdateError> {
        match (config.mode, config.base_url.as_deref()) {
            (StatusRpcMode::Http, Some(base_url)) => Self::http(base_url, Duration::from_millis(config.timeout_ms)),
            (StatusRpcMode::Http, None) => Err(StatusUpdateError::Internal(
                "status_rpc.base_url is not set".to_string(),
            )),
            (StatusRpcMode::Local, _) => Ok(Self::Local(coordinator)),
        }
    }

    pub fn http(base_url: &str, timeout: Duration) -> Result<Self, StatusUpdateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StatusUpdateError::Transport(e.to_string()))?;
        Ok(Self::Http {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Applies a status update.
    pub async fn update_status(
        &self,
        request: StatusUpdateRequest,
    ) -> Result<StatusUpdateResponse, StatusUpdateError> {
        match self {
            Self::Local(coordinator) => {
                let coordinator = Arc::clone(coordinator);
                tokio::task::spawn_blocking(move || coordinator.update_status(&request))
                    .await
                    .map_err(|e| StatusUpdateError::Internal(format!("task join error: {e}")))?
                    .map(StatusUpdateResponse::from)
                    .map_err(StatusUpdateError::from)
            }
            Self::Http { client, base_url } => {
                let url = format!(
                    "{}/internal/documents/{}/status",
                    base_url, request.entity_id
                );
                let response = client
                    .post(&url)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| StatusUpdateError::Transport(e.to_string()))?;

                let status = response.status();
                if status.is_success() {
                    return response
                        .json::<StatusUpdateResponse>()
                        .await
                        .map_err(|e| StatusUpdateError::Transport(e.to_string()));
                }

                let message = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|body| body.get("error").and_then(|v| v.as_str()).map(String::from))
                    .unwrap_or_else(|| status.to_string());
                Err(match status {
                    StatusCode::NOT_FOUND => StatusUpdateError::NotFound(message),
                    StatusCode::CONFLICT => StatusUpdateError::VersionConflict(message),
                    StatusCode::UNPROCESSABLE_ENTITY => StatusUpdateError::InvalidTransition(message),
                    _ => StatusUpdateError::Internal(message),
                })
            }
        }
    }
}
