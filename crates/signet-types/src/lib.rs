//! Shared types for the Signet document and signature platform.
//!
//! This crate holds the entity model observed by the change-propagation
//! pipeline (documents, signatures, document status), the canonical
//! [`ChangeRecord`] produced by the change-log decoder, and the request and
//! response shapes of the cross-service status-update call.
//!
//! Every other crate in the workspace depends on `signet-types` for these
//! definitions; `signet-types` itself depends on nothing internal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod change;
mod status;

pub use change::{ChangeKind, ChangeRecord, EntitySnapshot};
pub use status::{StatusUpdateRequest, StatusUpdateResponse};

/// Mints a new entity identifier.
///
/// Identifiers are UUIDv7: 128-bit, unique, and sortable by creation time.
pub fn new_entity_id() -> Uuid {
    Uuid::now_v7()
}

/// The kinds of entity whose mutations flow through the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A document row in the `documents` table.
    Document,
    /// A signature row in the `signatures` table.
    Signature,
}

impl EntityType {
    /// Returns the canonical label stored in the change log.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Signature => "signature",
        }
    }

    /// Returns the source table name used in upstream change payloads.
    pub fn table(self) -> &'static str {
        match self {
            Self::Document => "documents",
            Self::Signature => "signatures",
        }
    }

    /// Resolves an entity type from a source table name.
    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "documents" => Some(Self::Document),
            "signatures" => Some(Self::Signature),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(Self::Document),
            "signature" => Ok(Self::Signature),
            _ => Err(ParseEnumError {
                kind: "entity type",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Freshly created, not yet sent to a signer.
    Created,
    /// Sent to one or more signers.
    Sent,
    /// Opened by a signer.
    Viewed,
    /// At least one signature has been recorded.
    Signed,
    /// Retired from active use.
    Archived,
    /// Withdrawn before signing completed.
    Cancelled,
}

impl DocumentStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [DocumentStatus; 6] = [
        Self::Created,
        Self::Sent,
        Self::Viewed,
        Self::Signed,
        Self::Archived,
        Self::Cancelled,
    ];

    /// Returns the lowercase label used on the wire and in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Sent => "sent",
            Self::Viewed => "viewed",
            Self::Signed => "signed",
            Self::Archived => "archived",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns `true` if a document in `self` may move to `next`.
    ///
    /// A transition to the same status is not a transition; callers treat it
    /// as a no-op before consulting this table.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Created, Sent | Viewed | Signed | Archived | Cancelled)
                | (Sent, Viewed | Signed | Archived | Cancelled)
                | (Viewed, Signed | Archived | Cancelled)
                | (Signed, Archived)
                | (Cancelled, Archived)
        )
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "document status",
                value: s.to_string(),
            })
    }
}

/// Error returned when parsing an unknown enum label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

/// A document as stored in the transactional store.
///
/// This is also the snapshot shape carried in the `before`/`after` images of
/// document change records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub content_type: String,
    pub content_size: i64,
    /// Object key of the content in the content store. `None` until the
    /// content write has completed.
    #[serde(default)]
    pub content_reference: Option<String>,
    /// Hex-encoded SHA-256 of the stored content.
    #[serde(default)]
    pub content_digest: Option<String>,
    pub status: DocumentStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every committed mutation, starting at 1.
    pub version: i64,
}

/// A signature recorded against a document. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub id: Uuid,
    pub document_id: Uuid,
    pub signer_email: String,
    pub signer_name: String,
    pub signed_at: DateTime<Utc>,
    /// Object key of the signature image, if one was supplied.
    #[serde(default)]
    pub content_reference: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Always 1: signatures are never mutated.
    pub version: i64,
}
