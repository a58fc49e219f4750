//! Persistence operations for the partitioned change log.
//!
//! Appends happen inside the caller's write transaction; reads and cursor
//! updates are issued by consumer workers on their own pooled connections.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use signet_types::{ChangeKind, EntitySnapshot, EntityType};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::ChangeLogError;
use crate::payload::{ChangePayload, SourceInfo};

/// A mutation about to be recorded.
#[derive(Debug, Clone, Copy)]
pub struct NewChange<'a> {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub kind: ChangeKind,
    pub before: Option<&'a EntitySnapshot>,
    pub after: Option<&'a EntitySnapshot>,
}

/// A row of the `change_log` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: i64,
    pub partition: u32,
    pub log_position: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub transaction_id: String,
    pub payload_json: String,
    pub captured_at: String,
}

/// Maps an entity id onto one of `partitions` partitions.
///
/// Uses the first eight bytes of the SHA-256 of the id, so the mapping is
/// stable across processes and restarts.
pub fn partition_for(entity_id: Uuid, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(entity_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions)) as u32
}

fn image_value(snapshot: &EntitySnapshot) -> Result<serde_json::Value, serde_json::Error> {
    match snapshot {
        EntitySnapshot::Document(d) => serde_json::to_value(d),
        EntitySnapshot::Signature(s) => serde_json::to_value(s),
    }
}

/// Appends one change record.
///
/// Must run inside the write transaction that commits the mutation: the
/// position is read as `MAX + 1` for the partition and SQLite's single
/// writer lock keeps it unique until commit.
///
/// # Errors
///
/// Returns `ChangeLogError::MissingImage` if the change lacks an image its
/// kind requires, or a database/serialization error.
pub fn append(
    conn: &Connection,
    partitions: u32,
    change: &NewChange<'_>,
) -> Result<LogEntry, ChangeLogError> {
    let needs_before = matches!(change.kind, ChangeKind::Update | ChangeKind::Delete);
    let needs_after = change.kind != ChangeKind::Delete;
    if needs_before && change.before.is_none() {
        return Err(ChangeLogError::MissingImage {
            entity_id: change.entity_id.to_string(),
            image: "before",
        });
    }
    if needs_after && change.after.is_none() {
        return Err(ChangeLogError::MissingImage {
            entity_id: change.entity_id.to_string(),
            image: "after",
        });
    }

    let partition = partition_for(change.entity_id, partitions);
    let log_position: i64 = conn.query_row(
        "SELECT COALESCE(MAX(log_position), 0) + 1 FROM change_log WHERE partition_id = ?1",
        params![partition],
        |row| row.get(0),
    )?;

    let now = Utc::now();
    let transaction_id = Uuid::new_v4().to_string();
    let payload = ChangePayload {
        op: change.kind.op_code().to_string(),
        before: change.before.map(image_value).transpose()?,
        after: change.after.map(image_value).transpose()?,
        source: SourceInfo {
            table: change.entity_type.table().to_string(),
            transaction_id: transaction_id.clone(),
            sequence: log_position,
            ts_ms: now.timestamp_millis(),
        },
    };
    let payload_json = serde_json::to_string(&payload)?;
    let captured_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let entity_id = change.entity_id.to_string();

    let id: i64 = conn.query_row(
        "INSERT INTO change_log
            (partition_id, log_position, entity_type, entity_id, transaction_id, payload_json, captured_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         RETURNING id",
        params![
            partition,
            log_position,
            change.entity_type.as_str(),
            entity_id,
            transaction_id,
            payload_json,
            captured_at,
        ],
        |row| row.get(0),
    )?;

    tracing::debug!(
        entity_type = change.entity_type.as_str(),
        entity_id = %change.entity_id,
        op = change.kind.op_code(),
        partition,
        log_position,
        "appended change record"
    );

    Ok(LogEntry {
        id,
        partition,
        log_position,
        entity_type: change.entity_type.as_str().to_string(),
        entity_id,
        transaction_id,
        payload_json,
        captured_at,
    })
}

/// Reads up to `limit` entries of `partition` with positions greater than
/// `after_position`, oldest first.
///
/// # Errors
///
/// Returns `ChangeLogError::Database` on SQL failure.
pub fn read_partition(
    conn: &Connection,
    partition: u32,
    after_position: i64,
    limit: usize,
) -> Result<Vec<LogEntry>, ChangeLogError> {
    let mut stmt = conn.prepare(
        "SELECT id, partition_id, log_position, entity_type, entity_id, transaction_id, payload_json, captured_at
         FROM change_log
         WHERE partition_id = ?1 AND log_position > ?2
         ORDER BY log_position ASC
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(
        params![partition, after_position, limit as i64],
        |row| {
            Ok(LogEntry {
                id: row.get(0)?,
                partition: row.get(1)?,
                log_position: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                transaction_id: row.get(5)?,
                payload_json: row.get(6)?,
                captured_at: row.get(7)?,
            })
        },
    )?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

/// Returns the highest position per partition that has any entries.
///
/// # Errors
///
/// Returns `ChangeLogError::Database` on SQL failure.
pub fn partition_heads(conn: &Connection) -> Result<Vec<(u32, i64)>, ChangeLogError> {
    let mut stmt = conn.prepare(
        "SELECT partition_id, MAX(log_position) FROM change_log
         GROUP BY partition_id ORDER BY partition_id",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut heads = Vec::new();
    for row in rows {
        heads.push(row?);
    }
    Ok(heads)
}

/// Loads the committed cursor of `consumer_group` for `partition`.
///
/// Returns 0 when the group has never committed on this partition.
///
/// # Errors
///
/// Returns `ChangeLogError::Database` on SQL failure.
pub fn load_cursor(
    conn: &Connection,
    consumer_group: &str,
    partition: u32,
) -> Result<i64, ChangeLogError> {
    let position: Option<i64> = conn
        .query_row(
            "SELECT log_position FROM consumer_cursors
             WHERE consumer_group = ?1 AND partition_id = ?2",
            params![consumer_group, partition],
            |row| row.get(0),
        )
        .optional()?;
    Ok(position.unwrap_or(0))
}

/// Commits `position` as processed. A cursor never moves backwards through
/// this call; use [`rewind_cursor`] to replay.
///
/// # Errors
///
/// Returns `ChangeLogError::Database` on SQL failure.
pub fn commit_cursor(
    conn: &Connection,
    consumer_group: &str,
    partition: u32,
    position: i64,
) -> Result<(), ChangeLogError> {
    conn.execute(
        "INSERT INTO consumer_cursors (consumer_group, partition_id, log_position, committed_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(consumer_group, partition_id) DO UPDATE SET
            log_position = MAX(consumer_cursors.log_position, excluded.log_position),
            committed_at = excluded.committed_at",
        params![consumer_group, partition, position, now_rfc3339()],
    )?;
    Ok(())
}

/// Sets the cursor unconditionally, allowing a consumer group to replay
/// from an earlier position.
///
/// # Errors
///
/// Returns `ChangeLogError::Database` on SQL failure.
pub fn rewind_cursor(
    conn: &Connection,
    consumer_group: &str,
    partition: u32,
    position: i64,
) -> Result<(), ChangeLogError> {
    conn.execute(
        "INSERT INTO consumer_cursors (consumer_group, partition_id, log_position, committed_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(consumer_group, partition_id) DO UPDATE SET
            log_position = excluded.log_position,
            committed_at = excluded.committed_at",
        params![consumer_group, partition, position, now_rfc3339()],
    )?;
    tracing::info!(consumer_group, partition, position, "rewound consumer cursor");
    Ok(())
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Signals that new entries may be available.
///
/// Writers call [`LogHead::advance`] after each commit that appended to the
/// log; idle consumers wait on a receiver instead of polling hot.
#[derive(Debug, Clone)]
pub struct LogHead {
    tx: Arc<watch::Sender<u64>>,
}

impl LogHead {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Wakes every waiting consumer.
    pub fn advance(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for LogHead {
    fn default() -> Self {
        Self::new()
    }
}
