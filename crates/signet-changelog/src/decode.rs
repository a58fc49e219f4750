//! Normalizes raw change-log rows into canonical [`ChangeRecord`]s.

use chrono::DateTime;
use serde_json::Value;
use signet_types::{ChangeKind, ChangeRecord, Document, EntitySnapshot, EntityType, Signature};
use uuid::Uuid;

use crate::error::DecodeError;
use crate::log::LogEntry;
use crate::payload::ChangePayload;

/// Decodes one log entry.
///
/// The kind follows the declared `op`, which must agree with which images
/// are present: create has only `after`, update has both, delete has only
/// `before`, and a snapshot read has only `after`. Position and partition
/// come from the log row.
///
/// # Errors
///
/// Returns a [`DecodeError`] for unparseable JSON, an unknown table or op,
/// an op that contradicts the images, a missing entity id, a missing
/// `after.version` on a non-delete, or an image that does not match its
/// entity shape.
pub fn decode(entry: &LogEntry) -> Result<ChangeRecord, DecodeError> {
    let malformed = |reason: String| DecodeError {
        partition: entry.partition,
        position: entry.log_position,
        reason,
    };

    let payload: ChangePayload = serde_json::from_str(&entry.payload_json)
        .map_err(|e| malformed(format!("invalid payload json: {e}")))?;

    let entity_type = EntityType::from_table(&payload.source.table)
        .ok_or_else(|| malformed(format!("unknown source table '{}'", payload.source.table)))?;

    let kind = ChangeKind::from_op_code(&payload.op)
        .ok_or_else(|| malformed(format!("unknown op '{}'", payload.op)))?;

    let (has_before, has_after) = (payload.before.is_some(), payload.after.is_some());
    let consistent = match kind {
        ChangeKind::Create | ChangeKind::Snapshot => !has_before && has_after,
        ChangeKind::Update => has_before && has_after,
        ChangeKind::Delete => has_before && !has_after,
    };
    if !consistent {
        return Err(malformed(format!(
            "op '{}' contradicts images (before: {has_before}, after: {has_after})",
            payload.op
        )));
    }

    if let Some(after) = &payload.after {
        if after.get("version").and_then(Value::as_i64).is_none() {
            return Err(malformed("after image has no version".to_string()));
        }
    }

    let before = payload
        .before
        .map(|v| snapshot(entity_type, v))
        .transpose()
        .map_err(|e| malformed(format!("before image: {e}")))?;
    let after = payload
        .after
        .map(|v| snapshot(entity_type, v))
        .transpose()
        .map_err(|e| malformed(format!("after image: {e}")))?;

    let entity_id = match (&before, &after) {
        (Some(b), Some(a)) if b.id() != a.id() => {
            return Err(malformed("before and after images disagree on id".to_string()));
        }
        (_, Some(image)) | (Some(image), None) => image.id(),
        (None, None) => return Err(malformed("no image".to_string())),
    };

    if let Ok(row_id) = entry.entity_id.parse::<Uuid>() {
        if row_id != entity_id {
            return Err(malformed(format!(
                "row entity id {row_id} does not match image id {entity_id}"
            )));
        }
    }

    let captured_at = DateTime::from_timestamp_millis(payload.source.ts_ms)
        .ok_or_else(|| malformed(format!("invalid ts_ms {}", payload.source.ts_ms)))?;

    Ok(ChangeRecord {
        entity_type,
        entity_id,
        kind,
        before,
        after,
        partition: entry.partition,
        log_position: entry.log_position,
        transaction_id: payload.source.transaction_id,
        captured_at,
    })
}

fn snapshot(entity_type: EntityType, image: Value) -> Result<EntitySnapshot, String> {
    match image.get("id") {
        None | Some(Value::Null) => return Err("missing entity id".to_string()),
        Some(_) => {}
    }
    match entity_type {
        EntityType::Document => serde_json::from_value::<Document>(image)
            .map(EntitySnapshot::Document)
            .map_err(|e| e.to_string()),
        EntityType::Signature => serde_json::from_value::<Signature>(image)
            .map(EntitySnapshot::Signature)
            .map_err(|e| e.to_string()),
    }
}
