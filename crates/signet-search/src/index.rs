//! Keyed search index storage.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use signet_db::DbPool;
use uuid::Uuid;

use crate::error::SearchError;
use crate::projection::ProjectionDocument;

/// One keyed write against the index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOp {
    /// Create or fully replace the entry for `id`.
    Put(ProjectionDocument),
    /// Remove the entry; removing a missing key is a no-op.
    Delete(Uuid),
}

/// A keyed document index.
///
/// `apply` is atomic per call: either every op lands or none does. Ops are
/// applied in order, so a later op for the same key wins.
pub trait SearchIndex: Send + Sync + 'static {
    fn apply(&self, ops: &[IndexOp]) -> Result<(), SearchError>;
    fn get(&self, id: Uuid) -> Result<Option<ProjectionDocument>, SearchError>;
}

/// Search index stored in the `search_documents` table.
#[derive(Clone)]
pub struct SqliteSearchIndex {
    pool: DbPool,
}

impl SqliteSearchIndex {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) const PROJECTION_COLUMNS: &str =
    "entity_id, title, status, created_by, content_type, content_size, created_at, updated_at, version";

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn map_projection(row: &Row) -> rusqlite::Result<ProjectionDocument> {
    let failed = |idx: usize, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e)
    };
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    Ok(ProjectionDocument {
        id: id.parse().map_err(|e| failed(0, Box::new(e)))?,
        title: row.get(1)?,
        status: status.parse().map_err(|e| failed(2, Box::new(e)))?,
        created_by: row.get(3)?,
        content_type: row.get(4)?,
        content_size: row.get(5)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| failed(6, Box::new(e)))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| failed(7, Box::new(e)))?
            .with_timezone(&Utc),
        version: row.get(8)?,
    })
}

fn apply_op(conn: &Connection, op: &IndexOp) -> Result<(), SearchError> {
    match op {
        IndexOp::Put(doc) => {
            conn.execute(
                "INSERT INTO search_documents
                    (entity_id, title, status, created_by, content_type, content_size,
                     created_at, updated_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(entity_id) DO UPDATE SET
                    title = excluded.title,
                    status = excluded.status,
                    created_by = excluded.created_by,
                    content_type = excluded.content_type,
                    content_size = excluded.content_size,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at,
                    version = excluded.version",
                params![
                    doc.id.to_string(),
                    doc.title,
                    doc.status.as_str(),
                    doc.created_by,
                    doc.content_type,
                    doc.content_size,
                    timestamp(&doc.created_at),
                    timestamp(&doc.updated_at),
                    doc.version,
                ],
            )?;
        }
        IndexOp::Delete(id) => {
            conn.execute(
                "DELETE FROM search_documents WHERE entity_id = ?1",
                [id.to_string()],
            )?;
        }
    }
    Ok(())
}

impl SearchIndex for SqliteSearchIndex {
    fn apply(&self, ops: &[IndexOp]) -> Result<(), SearchError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        for op in ops {
            apply_op(&tx, op)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<ProjectionDocument>, SearchError> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT {PROJECTION_COLUMNS} FROM search_documents WHERE entity_id = ?1");
        Ok(conn
            .query_row(&sql, [id.to_string()], map_projection)
            .optional()?)
    }
}
