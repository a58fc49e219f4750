//! Projects document change records into the search index.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use signet_changelog::{ChangeHandler, HandlerError};
use signet_types::{ChangeKind, ChangeRecord, EntityType};

use crate::index::{IndexOp, SearchIndex};
use crate::projection::ProjectionDocument;

/// Counters for the projector.
#[derive(Debug, Default)]
pub struct ProjectorStats {
    upserted: AtomicU64,
    deleted: AtomicU64,
    filtered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProjectorStatsSnapshot {
    pub upserted: u64,
    pub deleted: u64,
    /// Records skipped because the document had no content reference.
    pub filtered: u64,
}

impl ProjectorStats {
    pub fn snapshot(&self) -> ProjectorStatsSnapshot {
        ProjectorStatsSnapshot {
            upserted: self.upserted.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
        }
    }
}

/// Consumer-group handler that keeps the search index in step with the log.
pub struct Projector<I> {
    index: Arc<I>,
    stats: Arc<ProjectorStats>,
}

impl<I: SearchIndex> Projector<I> {
    pub fn new(index: Arc<I>) -> Self {
        Self {
            index,
            stats: Arc::new(ProjectorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ProjectorStats> {
        Arc::clone(&self.stats)
    }

    /// Translates a batch into index ops. Returns the ops and the number of
    /// filtered records.
    fn plan(records: &[ChangeRecord]) -> (Vec<IndexOp>, u64) {
        let mut ops = Vec::with_capacity(records.len());
        let mut filtered = 0;

        for record in records {
            if record.entity_type != EntityType::Document {
                continue;
            }
            match record.kind {
                ChangeKind::Delete => ops.push(IndexOp::Delete(record.entity_id)),
                ChangeKind::Create | ChangeKind::Update | ChangeKind::Snapshot => {
                    let Some(doc) = record.after.as_ref().and_then(|s| s.as_document()) else {
                        continue;
                    };
                    if doc.content_reference.is_none() {
                        filtered += 1;
                        tracing::info!(
                            entity_id = %record.entity_id,
                            partition = record.partition,
                            position = record.log_position,
                            "skipping document without content reference"
                        );
                        continue;
                    }
                    ops.push(IndexOp::Put(ProjectionDocument::from(doc)));
                }
            }
        }

        (ops, filtered)
    }
}

impl<I: SearchIndex> ChangeHandler for Projector<I> {
    fn handle_batch(&self, records: &[ChangeRecord]) -> Result<(), HandlerError> {
        let (ops, filtered) = Self::plan(records);

        self.index.apply(&ops).map_err(|e| {
            tracing::warn!(ops = ops.len(), "search index rejected batch: {}", e);
            HandlerError(e.to_string())
        })?;

        let deleted = ops
            .iter()
            .filter(|op| matches!(op, IndexOp::Delete(_)))
            .count() as u64;
        self.stats
            .upserted
            .fetch_add(ops.len() as u64 - deleted, Ordering::Relaxed);
        self.stats.deleted.fetch_add(deleted, Ordering::Relaxed);
        self.stats.filtered.fetch_add(filtered, Ordering::Relaxed);

        tracing::debug!(ops = ops.len(), filtered, "applied batch to search index");
        Ok(())
    }
}
