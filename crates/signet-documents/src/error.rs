//! Error types for document and signature writes.

use signet_changelog::ChangeLogError;
use signet_types::{DocumentStatus, EntityType};
use uuid::Uuid;

use crate::content::ContentError;

/// Errors returned by the write coordinator and the read queries.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The external content write failed; nothing was committed.
    #[error("upstream content write failed: {0}")]
    UpstreamWriteFailure(#[source] ContentError),

    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to get database connection: {0}")]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    ChangeLog(#[from] ChangeLogError),
}
