use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use signet_types::{Document, DocumentStatus};
use uuid::Uuid;

/// The searchable view of a document, keyed by entity id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionDocument {
    pub id: Uuid,
    pub title: String,
    pub status: DocumentStatus,
    pub created_by: String,
    pub content_type: String,
    pub content_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl From<&Document> for ProjectionDocument {
    fn from(doc: &Document) -> Self {
        Self {
            id: doc.id,
            title: doc.title.clone(),
            status: doc.status,
            created_by: doc.created_by.clone(),
            content_type: doc.content_type.clone(),
            content_size: doc.content_size,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            version: doc.version,
        }
    }
}
