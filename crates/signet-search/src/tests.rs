//! Unit tests for the projector, index and queries.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use signet_changelog::ChangeHandler;
use signet_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use signet_types::{
    ChangeKind, ChangeRecord, Document, DocumentStatus, EntitySnapshot, EntityType, Signature,
};
use uuid::Uuid;

use crate::index::{IndexOp, SearchIndex, SqliteSearchIndex};
use crate::projection::ProjectionDocument;
use crate::projector::Projector;
use crate::query::{aggregate, search, suggest, AggregationField, SearchQuery};
use crate::SearchError;

fn test_pool() -> (tempfile::TempDir, DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("search.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    run_migrations(&pool.get().unwrap()).unwrap();
    (dir, pool)
}

fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-05-01T08:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn doc(id: Uuid, title: &str, status: DocumentStatus, version: i64) -> Document {
    Document {
        id,
        title: title.to_string(),
        content_type: "application/pdf".to_string(),
        content_size: 2048,
        content_reference: Some(format!("{id}/content")),
        content_digest: None,
        status,
        created_by: "legal@example.com".to_string(),
        created_at: base_time(),
        updated_at: base_time() + Duration::minutes(version),
        version,
    }
}

fn record(kind: ChangeKind, before: Option<Document>, after: Option<Document>) -> ChangeRecord {
    let entity_id = after.as_ref().or(before.as_ref()).map(|d| d.id).unwrap();
    ChangeRecord {
        entity_type: EntityType::Document,
        entity_id,
        kind,
        before: before.map(EntitySnapshot::Document),
        after: after.map(EntitySnapshot::Document),
        partition: 0,
        log_position: 1,
        transaction_id: "tx".to_string(),
        captured_at: base_time(),
    }
}

fn projector(pool: &DbPool) -> (Projector<SqliteSearchIndex>, Arc<SqliteSearchIndex>) {
    let index = Arc::new(SqliteSearchIndex::new(pool.clone()));
    (Projector::new(Arc::clone(&index)), index)
}

// ── projector ────────────────────────────────────────────────────────

#[test]
fn create_record_is_projected() {
    let (_dir, pool) = test_pool();
    let (projector, index) = projector(&pool);
    let d = doc(Uuid::now_v7(), "Employment contract", DocumentStatus::Created, 1);

    projector
        .handle_batch(&[record(ChangeKind::Create, None, Some(d.clone()))])
        .unwrap();

    let projected = index.get(d.id).unwrap().expect("document should be indexed");
    assert_eq!(projected, ProjectionDocument::from(&d));
    assert_eq!(projector.stats().snapshot().upserted, 1);
}

#[test]
fn replaying_a_record_is_idempotent() {
    let (_dir, pool) = test_pool();
    let (projector, index) = projector(&pool);
    let id = Uuid::now_v7();
    let v1 = doc(id, "NDA", DocumentStatus::Created, 1);
    let v2 = doc(id, "NDA", DocumentStatus::Viewed, 2);
    let update = record(ChangeKind::Update, Some(v1.clone()), Some(v2.clone()));

    projector
        .handle_batch(&[record(ChangeKind::Create, None, Some(v1)), update.clone()])
        .unwrap();
    let after_first = index.get(id).unwrap();

    projector.handle_batch(&[update]).unwrap();
    let after_replay = index.get(id).unwrap();

    assert_eq!(after_first, after_replay);
    let projected = after_replay.unwrap();
    assert_eq!(projected.version, 2);
    assert_eq!(projected.status, DocumentStatus::Viewed);

    let count: i64 = pool
        .get()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM search_documents", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1, "replay must not duplicate");
}

#[test]
fn record_without_content_reference_is_filtered() {
    let (_dir, pool) = test_pool();
    let (projector, index) = projector(&pool);
    let id = Uuid::now_v7();
    let mut draft = doc(id, "Draft", DocumentStatus::Created, 1);
    draft.content_reference = None;

    projector
        .handle_batch(&[record(ChangeKind::Create, None, Some(draft.clone()))])
        .unwrap();
    assert!(index.get(id).unwrap().is_none());
    assert_eq!(projector.stats().snapshot().filtered, 1);

    let complete = doc(id, "Draft", DocumentStatus::Created, 2);
    projector
        .handle_batch(&[record(ChangeKind::Update, Some(draft), Some(complete))])
        .unwrap();
    assert_eq!(index.get(id).unwrap().map(|d| d.version), Some(2));
}

#[test]
fn delete_removes_and_missing_delete_is_noop() {
    let (_dir, pool) = test_pool();
    let (projector, index) = projector(&pool);
    let d = doc(Uuid::now_v7(), "Old lease", DocumentStatus::Archived, 3);

    projector
        .handle_batch(&[record(ChangeKind::Snapshot, None, Some(d.clone()))])
        .unwrap();
    assert!(index.get(d.id).unwrap().is_some());

    let delete = record(ChangeKind::Delete, Some(d.clone()), None);
    projector.handle_batch(&[delete.clone()]).unwrap();
    projector.handle_batch(&[delete]).unwrap();
    assert!(index.get(d.id).unwrap().is_none());
    assert_eq!(projector.stats().snapshot().deleted, 2);
}

#[test]
fn signature_records_are_ignored() {
    let (_dir, pool) = test_pool();
    let (projector, _index) = projector(&pool);
    let sig = Signature {
        id: Uuid::now_v7(),
        document_id: Uuid::now_v7(),
        signer_email: "s@example.com".to_string(),
        signer_name: "S".to_string(),
        signed_at: base_time(),
        content_reference: None,
        ip_address: None,
        version: 1,
    };
    let rec = ChangeRecord {
        entity_type: EntityType::Signature,
        entity_id: sig.id,
        kind: ChangeKind::Create,
        before: None,
        after: Some(EntitySnapshot::Signature(sig)),
        partition: 0,
        log_position: 1,
        transaction_id: "tx".to_string(),
        captured_at: base_time(),
    };
    projector.handle_batch(&[rec]).unwrap();
    assert_eq!(projector.stats().snapshot().upserted, 0);
    assert_eq!(projector.stats().snapshot().filtered, 0);
}

#[test]
fn later_op_in_batch_wins() {
    let (_dir, pool) = test_pool();
    let index = SqliteSearchIndex::new(pool.clone());
    let id = Uuid::now_v7();
    let d = ProjectionDocument::from(&doc(id, "X", DocumentStatus::Sent, 2));
    index
        .apply(&[IndexOp::Put(d.clone()), IndexOp::Delete(id), IndexOp::Put(d.clone())])
        .unwrap();
    assert_eq!(index.get(id).unwrap(), Some(d));
}

// ── queries ──────────────────────────────────────────────────────────

fn seed(pool: &DbPool) -> Vec<Uuid> {
    let index = SqliteSearchIndex::new(pool.clone());
    let fixtures = [
        ("Service contract", DocumentStatus::Signed, "legal@example.com", 1),
        ("Contract addendum", DocumentStatus::Sent, "sales@example.com", 2),
        ("Holiday schedule", DocumentStatus::Created, "hr@example.com", 3),
        ("contractor onboarding", DocumentStatus::Signed, "hr@example.com", 4),
    ];
    let mut ids = Vec::new();
    let ops: Vec<IndexOp> = fixtures
        .iter()
        .map(|(title, status, creator, minutes)| {
            let id = Uuid::now_v7();
            ids.push(id);
            let mut d = doc(id, title, *status, 1);
            d.created_by = creator.to_string();
            d.created_at = base_time() + Duration::minutes(*minutes);
            IndexOp::Put(ProjectionDocument::from(&d))
        })
        .collect();
    index.apply(&ops).unwrap();
    ids
}

fn query(q: &str) -> SearchQuery {
    SearchQuery {
        q: q.to_string(),
        size: 10,
        ..SearchQuery::default()
    }
}

#[test]
fn search_matches_case_insensitively_and_ranks_newest_first() {
    let (_dir, pool) = test_pool();
    let ids = seed(&pool);
    let conn = pool.get().unwrap();

    let results = search(&conn, &query("CONTRACT")).unwrap();
    assert_eq!(results.total, 3);
    let found: Vec<Uuid> = results.documents.iter().map(|h| h.document.id).collect();
    // Equal scores, so newest first.
    assert_eq!(found, vec![ids[3], ids[1], ids[0]]);
    assert_eq!(
        results.documents[2].highlight.as_deref(),
        Some("Service <em>contract</em>")
    );
}

#[test]
fn highlight_follows_chars_whose_case_changes_length() {
    let (_dir, pool) = test_pool();
    let conn = pool.get().unwrap();
    let index = SqliteSearchIndex::new(pool.clone());
    // Both capitals change byte length when lowercased, in opposite
    // directions, so the title's total length is unchanged.
    let d = doc(Uuid::now_v7(), "ẞ Lease İ", DocumentStatus::Created, 1);
    index
        .apply(&[IndexOp::Put(ProjectionDocument::from(&d))])
        .unwrap();

    let results = search(&conn, &query("lease")).unwrap();
    assert_eq!(results.total, 1);
    assert_eq!(
        results.documents[0].highlight.as_deref(),
        Some("ẞ <em>Lease</em> İ")
    );
}

#[test]
fn search_applies_filters_and_paging() {
    let (_dir, pool) = test_pool();
    let ids = seed(&pool);
    let conn = pool.get().unwrap();

    let mut q = query("contract");
    q.status = Some(DocumentStatus::Signed);
    let signed = search(&conn, &q).unwrap();
    assert_eq!(signed.total, 2);

    q.created_by = Some("legal@example.com".to_string());
    let legal = search(&conn, &q).unwrap();
    assert_eq!(legal.documents.len(), 1);
    assert_eq!(legal.documents[0].document.id, ids[0]);

    let mut paged = query("contract");
    paged.from = 1;
    paged.size = 1;
    let page = search(&conn, &paged).unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.documents.len(), 1);
    assert_eq!(page.documents[0].document.id, ids[1]);
}

#[test]
fn search_scores_title_above_creator() {
    let (_dir, pool) = test_pool();
    let ids = seed(&pool);
    let conn = pool.get().unwrap();

    // "hr" hits two creators; "holiday" also hits a title.
    let results = search(&conn, &query("holiday hr")).unwrap();
    assert_eq!(results.documents[0].document.id, ids[2]);
    assert_eq!(results.documents[0].score, 3.0);
}

#[test]
fn search_rejects_bad_input() {
    let (_dir, pool) = test_pool();
    let conn = pool.get().unwrap();
    assert!(matches!(search(&conn, &query("  ")), Err(SearchError::InvalidQuery(_))));
    let mut q = query("x");
    q.size = 101;
    assert!(matches!(search(&conn, &q), Err(SearchError::InvalidQuery(_))));
}

#[test]
fn search_escapes_like_wildcards() {
    let (_dir, pool) = test_pool();
    seed(&pool);
    let conn = pool.get().unwrap();
    assert_eq!(search(&conn, &query("%")).unwrap().total, 0);
}

#[test]
fn suggest_is_prefix_based() {
    let (_dir, pool) = test_pool();
    seed(&pool);
    let conn = pool.get().unwrap();

    let titles = suggest(&conn, "con", 5).unwrap();
    assert_eq!(titles, vec!["Contract addendum", "contractor onboarding"]);
    assert!(matches!(suggest(&conn, "c", 5), Err(SearchError::InvalidQuery(_))));
}

#[test]
fn aggregate_counts_by_field() {
    let (_dir, pool) = test_pool();
    seed(&pool);
    let conn = pool.get().unwrap();

    let buckets = aggregate(&conn, AggregationField::Status, None).unwrap();
    assert_eq!(buckets[0].key, "signed");
    assert_eq!(buckets[0].count, 2);
    assert_eq!(buckets.iter().map(|b| b.count).sum::<i64>(), 4);

    let creators = aggregate(&conn, AggregationField::CreatedBy, Some("contract")).unwrap();
    let keys: Vec<&str> = creators.iter().map(|b| b.key.as_str()).collect();
    assert_eq!(keys, vec!["hr@example.com", "legal@example.com", "sales@example.com"]);

    assert!("title".parse::<AggregationField>().is_err());
}
