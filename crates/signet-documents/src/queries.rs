//! Read queries and row mapping for documents and signatures.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use signet_types::{Document, DocumentStatus, EntityType, Signature};
use uuid::Uuid;

use crate::error::WriteError;

pub(crate) const DOCUMENT_COLUMNS: &str = "id, title, content_type, content_size, content_reference, content_digest,
     status, created_by, created_at, updated_at, version";

pub(crate) const SIGNATURE_COLUMNS: &str =
    "id, document_id, signer_email, signer_name, signed_at, content_reference, ip_address, version";

/// Optional filters for [`list_documents`].
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub status: Option<DocumentStatus>,
    pub created_by: Option<String>,
    pub offset: i64,
    /// Defaults to 100 when `None`.
    pub limit: Option<i64>,
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn timestamp_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn map_document(row: &Row) -> rusqlite::Result<Document> {
    let status: String = row.get(6)?;
    Ok(Document {
        id: uuid_at(row, 0)?,
        title: row.get(1)?,
        content_type: row.get(2)?,
        content_size: row.get(3)?,
        content_reference: row.get(4)?,
        content_digest: row.get(5)?,
        status: status.parse().map_err(|e| conversion_error(6, e))?,
        created_by: row.get(7)?,
        created_at: timestamp_at(row, 8)?,
        updated_at: timestamp_at(row, 9)?,
        version: row.get(10)?,
    })
}

pub(crate) fn map_signature(row: &Row) -> rusqlite::Result<Signature> {
    Ok(Signature {
        id: uuid_at(row, 0)?,
        document_id: uuid_at(row, 1)?,
        signer_email: row.get(2)?,
        signer_name: row.get(3)?,
        signed_at: timestamp_at(row, 4)?,
        content_reference: row.get(5)?,
        ip_address: row.get(6)?,
        version: row.get(7)?,
    })
}

/// Fetches a document by id.
pub fn get_document(conn: &Connection, id: Uuid) -> Result<Document, WriteError> {
    find_document(conn, id)?.ok_or(WriteError::NotFound {
        entity_type: EntityType::Document,
        id,
    })
}

pub(crate) fn find_document(conn: &Connection, id: Uuid) -> Result<Option<Document>, WriteError> {
    let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1");
    Ok(conn
        .query_row(&sql, [id.to_string()], map_document)
        .optional()?)
}

/// Lists documents, newest first.
pub fn list_documents(
    conn: &Connection,
    filter: &DocumentFilter,
) -> Result<Vec<Document>, WriteError> {
    let mut clauses = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        values.push(Box::new(status.as_str()));
        clauses.push(format!("status = ?{}", values.len()));
    }
    if let Some(created_by) = &filter.created_by {
        values.push(Box::new(created_by.clone()));
        clauses.push(format!("created_by = ?{}", values.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    values.push(Box::new(filter.limit.unwrap_or(100)));
    let limit_idx = values.len();
    values.push(Box::new(filter.offset.max(0)));
    let offset_idx = values.len();

    let sql = format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents {where_clause}
         ORDER BY created_at DESC, id DESC
         LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
    );
    let params: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|v| v.as_ref()).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), map_document)?;
    let mut documents = Vec::new();
    for row in rows {
        documents.push(row?);
    }
    Ok(documents)
}

/// Fetches a signature by id.
pub fn get_signature(conn: &Connection, id: Uuid) -> Result<Signature, WriteError> {
    let sql = format!("SELECT {SIGNATURE_COLUMNS} FROM signatures WHERE id = ?1");
    conn.query_row(&sql, [id.to_string()], map_signature)
        .optional()?
        .ok_or(WriteError::NotFound {
            entity_type: EntityType::Signature,
            id,
        })
}

/// Lists every signature, most recent first.
pub fn list_signatures(
    conn: &Connection,
    offset: i64,
    limit: i64,
) -> Result<Vec<Signature>, WriteError> {
    let sql = format!(
        "SELECT {SIGNATURE_COLUMNS} FROM signatures
         ORDER BY signed_at DESC, id DESC LIMIT ?1 OFFSET ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit, offset.max(0)], map_signature)?;
    let mut signatures = Vec::new();
    for row in rows {
        signatures.push(row?);
    }
    Ok(signatures)
}

/// Lists the signatures of one document in signing order.
pub fn list_signatures_for_document(
    conn: &Connection,
    document_id: Uuid,
) -> Result<Vec<Signature>, WriteError> {
    let sql = format!(
        "SELECT {SIGNATURE_COLUMNS} FROM signatures
         WHERE document_id = ?1 ORDER BY signed_at ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([document_id.to_string()], map_signature)?;
    let mut signatures = Vec::new();
    for row in rows {
        signatures.push(row?);
    }
    Ok(signatures)
}
