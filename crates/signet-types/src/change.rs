//! Canonical change records produced by the change-log decoder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Document, EntityType, Signature};

/// Classification of a committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// `before` is absent, `after` is present.
    Create,
    /// Both images are present.
    Update,
    /// `before` is present, `after` is absent.
    Delete,
    /// A full-state read emitted outside a mutation (backfill or resnapshot).
    /// Carries only an `after` image.
    Snapshot,
}

impl ChangeKind {
    /// Returns the single-letter operation code used in upstream payloads.
    pub fn op_code(self) -> &'static str {
        match self {
            Self::Create => "c",
            Self::Update => "u",
            Self::Delete => "d",
            Self::Snapshot => "r",
        }
    }

    /// Resolves an upstream operation code.
    pub fn from_op_code(op: &str) -> Option<Self> {
        match op {
            "c" => Some(Self::Create),
            "u" => Some(Self::Update),
            "d" => Some(Self::Delete),
            "r" => Some(Self::Snapshot),
            _ => None,
        }
    }
}

/// A typed before/after image of an entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EntitySnapshot {
    Document(Document),
    Signature(Signature),
}

impl EntitySnapshot {
    /// Returns the id of the entity this image describes.
    pub fn id(&self) -> Uuid {
        match self {
            Self::Document(d) => d.id,
            Self::Signature(s) => s.id,
        }
    }

    /// Returns the entity version captured in this image.
    pub fn version(&self) -> i64 {
        match self {
            Self::Document(d) => d.version,
            Self::Signature(s) => s.version,
        }
    }

    /// Returns the document image, if this is one.
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Self::Document(d) => Some(d),
            Self::Signature(_) => None,
        }
    }

    /// Returns the signature image, if this is one.
    pub fn as_signature(&self) -> Option<&Signature> {
        match self {
            Self::Signature(s) => Some(s),
            Self::Document(_) => None,
        }
    }
}

/// Canonical representation of one committed mutation.
///
/// For a given `entity_id`, `log_position` values are strictly increasing
/// because every record for that id lands in the same partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub kind: ChangeKind,
    pub before: Option<EntitySnapshot>,
    pub after: Option<EntitySnapshot>,
    /// Change-log partition the record was read from.
    pub partition: u32,
    /// Monotonic sequence within `partition`.
    pub log_position: i64,
    pub transaction_id: String,
    pub captured_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Returns the most recent image available: `after`, or `before` for
    /// deletes.
    pub fn latest(&self) -> Option<&EntitySnapshot> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// Returns the `(old, new)` document statuses if this record changed a
    /// document's status.
    pub fn status_change(&self) -> Option<(crate::DocumentStatus, crate::DocumentStatus)> {
        let before = self.before.as_ref()?.as_document()?;
        let after = self.after.as_ref()?.as_document()?;
        (before.status != after.status).then_some((before.status, after.status))
    }

    /// Returns the capture time in epoch milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        self.captured_at.timestamp_millis()
    }
}
