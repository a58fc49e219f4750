//! Wire shapes of the cross-service document status-update call.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Document, DocumentStatus};

/// Request to move a document to a new status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub entity_id: Uuid,
    pub new_status: DocumentStatus,
    /// When set, the update only applies if the stored version matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
}

/// Successful status-update response: the updated snapshot plus its headline
/// fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdateResponse {
    pub entity: Document,
    pub status: DocumentStatus,
    pub version: i64,
}

impl From<Document> for StatusUpdateResponse {
    fn from(entity: Document) -> Self {
        Self {
            status: entity.status,
            version: entity.version,
            entity,
        }
    }
}
