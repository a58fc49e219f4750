//! The write coordinator: every committed mutation yields one change record.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Transaction, TransactionBehavior};
use signet_changelog::{append, LogHead, NewChange};
use signet_db::DbPool;
use signet_types::{
    new_entity_id, ChangeKind, Document, DocumentStatus, EntitySnapshot, EntityType, Signature,
    StatusUpdateRequest,
};
use uuid::Uuid;

use crate::content::{ContentError, ContentRef, ContentStore};
use crate::error::WriteError;
use crate::queries::{find_document, map_document, DOCUMENT_COLUMNS};

const MAX_TITLE_CHARS: usize = 255;
const MAX_SIGNER_FIELD_CHARS: usize = 255;

/// Limits and partitioning used by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSettings {
    /// Number of change-log partitions.
    pub partitions: u32,
    pub max_content_bytes: usize,
    pub max_signature_bytes: usize,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self {
            partitions: 4,
            max_content_bytes: 10 * 1024 * 1024,
            max_signature_bytes: 1024 * 1024,
        }
    }
}

/// Input for [`WriteCoordinator::create_document`].
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    /// `None` creates a document with no stored content yet.
    pub content: Option<Vec<u8>>,
    pub content_type: String,
    pub created_by: String,
}

/// Partial update for [`WriteCoordinator::update_document`].
#[derive(Debug, Clone, Default)]
pub struct DocumentPatch {
    pub title: Option<String>,
    pub status: Option<DocumentStatus>,
    /// Replaces the stored content. Written under a new key before the
    /// commit; the previous object is left in place.
    pub content: Option<Vec<u8>>,
    pub content_type: Option<String>,
}

/// Input for [`WriteCoordinator::create_signature`].
#[derive(Debug, Clone)]
pub struct NewSignature {
    pub document_id: Uuid,
    pub signer_email: String,
    pub signer_name: String,
    /// Signature image bytes, stored before the commit.
    pub signature_data: Option<Vec<u8>>,
    pub ip_address: Option<String>,
}

/// Serializes entity mutations with their change-log records.
pub struct WriteCoordinator {
    pool: DbPool,
    content: Arc<dyn ContentStore>,
    head: LogHead,
    settings: WriteSettings,
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Each content write gets its own key; committing the row is what makes a
/// version live, so a rejected commit leaves only an unreferenced object.
fn document_content_key(id: Uuid) -> String {
    format!("{id}/content/{}", Uuid::now_v7())
}

fn signature_content_key(id: Uuid) -> String {
    format!("{id}/signature.png")
}

fn validate_title(title: &str) -> Result<String, WriteError> {
    let title = title.trim();
    if title.is_empty() || title.chars().count() > MAX_TITLE_CHARS {
        return Err(WriteError::Validation(format!(
            "title must be 1 to {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(title.to_string())
}

fn check_version(current: &Document, expected: Option<i64>) -> Result<(), WriteError> {
    match expected {
        Some(expected) if expected != current.version => Err(WriteError::VersionConflict {
            expected,
            actual: current.version,
        }),
        _ => Ok(()),
    }
}

fn check_transition(from: DocumentStatus, to: DocumentStatus) -> Result<(), WriteError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(WriteError::InvalidTransition { from, to })
    }
}

fn insert_document(tx: &Transaction<'_>, doc: &Document) -> Result<(), WriteError> {
    tx.execute(
        "INSERT INTO documents
            (id, title, content_type, content_size, content_reference, content_digest,
             status, created_by, created_at, updated_at, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            doc.id.to_string(),
            doc.title,
            doc.content_type,
            doc.content_size,
            doc.content_reference,
            doc.content_digest,
            doc.status.as_str(),
            doc.created_by,
            timestamp(&doc.created_at),
            timestamp(&doc.updated_at),
            doc.version,
        ],
    )?;
    Ok(())
}

impl WriteCoordinator {
    pub fn new(
        pool: DbPool,
        content: Arc<dyn ContentStore>,
        head: LogHead,
        settings: WriteSettings,
    ) -> Self {
        Self {
            pool,
            content,
            head,
            settings,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn settings(&self) -> WriteSettings {
        self.settings
    }

    /// Reads stored content by key.
    pub fn read_content(&self, key: &str) -> Result<Vec<u8>, ContentError> {
        self.content.get(key)
    }

    fn put_content(&self, key: &str, bytes: &[u8]) -> Result<ContentRef, WriteError> {
        self.content.put(key, bytes).map_err(|e| {
            tracing::warn!(key, "content write failed, aborting before commit: {}", e);
            WriteError::UpstreamWriteFailure(e)
        })
    }

    /// Runs `f` in an immediate write transaction. `f` reports whether it
    /// appended to the change log; if so, consumers are woken after commit.
    fn write_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<(T, bool), WriteError>,
    ) -> Result<T, WriteError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (out, appended) = f(&tx)?;
        tx.commit()?;
        if appended {
            self.head.advance();
        }
        Ok(out)
    }

    fn append_document(
        &self,
        tx: &Transaction<'_>,
        kind: ChangeKind,
        before: Option<&Document>,
        after: Option<&Document>,
    ) -> Result<(), WriteError> {
        let before = before.cloned().map(EntitySnapshot::Document);
        let after = after.cloned().map(EntitySnapshot::Document);
        let entity_id = after
            .as_ref()
            .or(before.as_ref())
            .map(EntitySnapshot::id)
            .unwrap_or_default();
        append(
            tx,
            self.settings.partitions,
            &NewChange {
                entity_type: EntityType::Document,
                entity_id,
                kind,
                before: before.as_ref(),
                after: after.as_ref(),
            },
        )?;
        Ok(())
    }

    /// Bumps the version, writes the row, and records the update.
    fn commit_update(
        &self,
        tx: &Transaction<'_>,
        current: &Document,
        mut next: Document,
    ) -> Result<Document, WriteError> {
        next.version = current.version + 1;
        next.updated_at = now();

        let updated = tx.execute(
            "UPDATE documents SET
                title = ?1, content_type = ?2, content_size = ?3, content_reference = ?4,
                content_digest = ?5, status = ?6, updated_at = ?7, version = ?8
             WHERE id = ?9 AND version = ?10",
            params![
                next.title,
                next.content_type,
                next.content_size,
                next.content_reference,
                next.content_digest,
                next.status.as_str(),
                timestamp(&next.updated_at),
                next.version,
                next.id.to_string(),
                current.version,
            ],
        )?;
        if updated == 0 {
            return Err(WriteError::VersionConflict {
                expected: current.version,
                actual: current.version + 1,
            });
        }

        self.append_document(tx, ChangeKind::Update, Some(current), Some(&next))?;
        Ok(next)
    }

    fn load_for_write(tx: &Transaction<'_>, id: Uuid) -> Result<Document, WriteError> {
        find_document(tx, id)?.ok_or(WriteError::NotFound {
            entity_type: EntityType::Document,
            id,
        })
    }

    /// Creates a document at version 1 with status `created`.
    ///
    /// Content, when supplied, is stored under `{id}/content/{version_key}`
    /// before the commit.
    pub fn create_document(&self, new: NewDocument) -> Result<Document, WriteError> {
        let title = validate_title(&new.title)?;
        if new.created_by.trim().is_empty() {
            return Err(WriteError::Validation("created_by is required".to_string()));
        }
        if new.content_type.trim().is_empty() {
            return Err(WriteError::Validation("content_type is required".to_string()));
        }
        if let Some(content) = &new.content {
            if content.len() > self.settings.max_content_bytes {
                return Err(WriteError::Validation(format!(
                    "content exceeds {} byte limit",
                    self.settings.max_content_bytes
                )));
            }
        }

        let id = new_entity_id();
        let stored = new
            .content
            .as_deref()
            .map(|bytes| self.put_content(&document_content_key(id), bytes))
            .transpose()?;

        let created_at = now();
        let doc = Document {
            id,
            title,
            content_type: new.content_type,
            content_size: stored.as_ref().map_or(0, |s| s.size),
            content_reference: stored.as_ref().map(|s| s.key.clone()),
            content_digest: stored.map(|s| s.digest),
            status: DocumentStatus::Created,
            created_by: new.created_by,
            created_at,
            updated_at: created_at,
            version: 1,
        };

        self.write_tx(|tx| {
            insert_document(tx, &doc)?;
            self.append_document(tx, ChangeKind::Create, None, Some(&doc))?;
            Ok(((), true))
        })?;

        tracing::info!(document_id = %doc.id, title = %doc.title, "document created");
        Ok(doc)
    }

    /// Applies a partial update. A patch that changes nothing commits
    /// nothing and returns the current snapshot.
    pub fn update_document(
        &self,
        id: Uuid,
        patch: DocumentPatch,
        expected_version: Option<i64>,
    ) -> Result<Document, WriteError> {
        let title = patch.title.as_deref().map(validate_title).transpose()?;
        if let Some(content) = &patch.content {
            if content.len() > self.settings.max_content_bytes {
                return Err(WriteError::Validation(format!(
                    "content exceeds {} byte limit",
                    self.settings.max_content_bytes
                )));
            }
        }

        let stored = match &patch.content {
            Some(bytes) => {
                let conn = self.pool.get()?;
                if find_document(&conn, id)?.is_none() {
                    return Err(WriteError::NotFound {
                        entity_type: EntityType::Document,
                        id,
                    });
                }
                drop(conn);
                Some(self.put_content(&document_content_key(id), bytes)?)
            }
            None => None,
        };

        let doc = self.write_tx(|tx| {
            let current = Self::load_for_write(tx, id)?;
            check_version(&current, expected_version)?;

            let mut next = current.clone();
            if let Some(title) = title {
                next.title = title;
            }
            if let Some(content_type) = patch.content_type {
                next.content_type = content_type;
            }
            if let Some(stored) = stored {
                next.content_size = stored.size;
                next.content_reference = Some(stored.key);
                next.content_digest = Some(stored.digest);
            }
            if let Some(status) = patch.status {
                if status != current.status {
                    check_transition(current.status, status)?;
                    next.status = status;
                }
            }

            if next == current {
                return Ok((current, false));
            }
            let next = self.commit_update(tx, &current, next)?;
            Ok((next, true))
        })?;

        tracing::info!(document_id = %id, version = doc.version, "document updated");
        Ok(doc)
    }

    /// Deletes a document and records a delete change carrying its last
    /// image. Returns that image.
    pub fn delete_document(
        &self,
        id: Uuid,
        expected_version: Option<i64>,
    ) -> Result<Document, WriteError> {
        let doc = self.write_tx(|tx| {
            let current = Self::load_for_write(tx, id)?;
            check_version(&current, expected_version)?;
            tx.execute("DELETE FROM documents WHERE id = ?1", [id.to_string()])?;
            self.append_document(tx, ChangeKind::Delete, Some(&current), None)?;
            Ok((current, true))
        })?;

        tracing::info!(document_id = %id, "document deleted");
        Ok(doc)
    }

    /// Moves a document to a new status.
    ///
    /// Requesting the current status is a no-op: nothing is committed, no
    /// change record is produced, and the current snapshot is returned.
    pub fn update_status(&self, request: &StatusUpdateRequest) -> Result<Document, WriteError> {
        let id = request.entity_id;
        let new_status = request.new_status;

        self.write_tx(|tx| {
            let current = Self::load_for_write(tx, id)?;
            if current.status == new_status {
                tracing::debug!(document_id = %id, status = %new_status, "status unchanged");
                return Ok((current, false));
            }
            check_version(&current, request.expected_version)?;
            check_transition(current.status, new_status)?;

            let mut next = current.clone();
            next.status = new_status;
            let next = self.commit_update(tx, &current, next)?;

            tracing::info!(
                document_id = %id,
                old_status = %current.status,
                new_status = %new_status,
                version = next.version,
                "document status updated"
            );
            Ok((next, true))
        })
    }

    /// Records a signature against an existing document.
    ///
    /// The signature image, when supplied, is stored under
    /// `{signature_id}/signature.png` before the commit.
    pub fn create_signature(&self, new: NewSignature) -> Result<Signature, WriteError> {
        let signer_name = new.signer_name.trim();
        if signer_name.is_empty() || signer_name.chars().count() > MAX_SIGNER_FIELD_CHARS {
            return Err(WriteError::Validation(format!(
                "signer_name must be 1 to {MAX_SIGNER_FIELD_CHARS} characters"
            )));
        }
        let signer_email = new.signer_email.trim();
        let valid_email = signer_email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !valid_email || signer_email.len() > MAX_SIGNER_FIELD_CHARS {
            return Err(WriteError::Validation(format!(
                "invalid signer_email: {signer_email}"
            )));
        }
        if let Some(data) = &new.signature_data {
            if data.len() > self.settings.max_signature_bytes {
                return Err(WriteError::Validation(format!(
                    "signature data exceeds {} byte limit",
                    self.settings.max_signature_bytes
                )));
            }
        }

        // Early exit before the image write; the transaction re-checks.
        {
            let conn = self.pool.get()?;
            if find_document(&conn, new.document_id)?.is_none() {
                return Err(WriteError::NotFound {
                    entity_type: EntityType::Document,
                    id: new.document_id,
                });
            }
        }

        let id = new_entity_id();
        let stored = new
            .signature_data
            .as_deref()
            .map(|bytes| self.put_content(&signature_content_key(id), bytes))
            .transpose()?;

        let signature = Signature {
            id,
            document_id: new.document_id,
            signer_email: signer_email.to_string(),
            signer_name: signer_name.to_string(),
            signed_at: now(),
            content_reference: stored.map(|s| s.key),
            ip_address: new.ip_address,
            version: 1,
        };

        self.write_tx(|tx| {
            Self::load_for_write(tx, signature.document_id)?;
            tx.execute(
                "INSERT INTO signatures
                    (id, document_id, signer_email, signer_name, signed_at, content_reference, ip_address, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    signature.id.to_string(),
                    signature.document_id.to_string(),
                    signature.signer_email,
                    signature.signer_name,
                    timestamp(&signature.signed_at),
                    signature.content_reference,
                    signature.ip_address,
                    signature.version,
                ],
            )?;
            let after = EntitySnapshot::Signature(signature.clone());
            append(
                tx,
                self.settings.partitions,
                &NewChange {
                    entity_type: EntityType::Signature,
                    entity_id: signature.id,
                    kind: ChangeKind::Create,
                    before: None,
                    after: Some(&after),
                },
            )?;
            Ok(((), true))
        })?;

        tracing::info!(
            signature_id = %signature.id,
            document_id = %signature.document_id,
            "signature created"
        );
        Ok(signature)
    }

    /// Appends a snapshot record for every stored document so consumers can
    /// rebuild their state. Returns the number of records written.
    pub fn resnapshot_documents(&self) -> Result<usize, WriteError> {
        let count = self.write_tx(|tx| {
            let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY created_at, id");
            let documents = {
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map([], map_document)?;
                let mut documents = Vec::new();
                for row in rows {
                    documents.push(row?);
                }
                documents
            };
            for doc in &documents {
                self.append_document(tx, ChangeKind::Snapshot, None, Some(doc))?;
            }
            Ok((documents.len(), !documents.is_empty()))
        })?;

        tracing::info!(count, "appended document snapshots");
        Ok(count)
    }
}
