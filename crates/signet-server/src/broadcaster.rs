//! Maps change records to live notifications and fans them out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use signet_changelog::{ChangeHandler, HandlerError};
use signet_types::{ChangeKind, ChangeRecord, DocumentStatus, EntitySnapshot};
use uuid::Uuid;

use crate::registry::ConnectionRegistry;

/// A notification pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub data: Value,
    /// Source commit time, epoch milliseconds.
    pub timestamp: i64,
}

fn status_event(new_status: DocumentStatus) -> &'static str {
    match new_status {
        DocumentStatus::Sent => "document.sent",
        DocumentStatus::Viewed => "document.viewed",
        DocumentStatus::Signed => "document.signed",
        _ => "document.status_changed",
    }
}

/// Builds the notification for `record`, with the entity whose subscribers
/// receive it. Snapshots and updates that change neither status nor title
/// produce nothing.
pub fn notification_for(record: &ChangeRecord) -> Option<(Uuid, Notification)> {
    let timestamp = record.timestamp_ms();
    let notify = |target: Uuid, event_type: &'static str, data: Value| {
        Some((
            target,
            Notification {
                event_type,
                data,
                timestamp,
            },
        ))
    };

    match (record.kind, record.before.as_ref(), record.after.as_ref()) {
        (ChangeKind::Create, _, Some(EntitySnapshot::Document(doc))) => notify(
            doc.id,
            "document.created",
            json!({
                "id": doc.id,
                "title": doc.title,
                "status": doc.status,
                "created_by": doc.created_by,
                "created_at": doc.created_at,
            }),
        ),
        (
            ChangeKind::Update,
            Some(EntitySnapshot::Document(before)),
            Some(EntitySnapshot::Document(after)),
        ) => {
            if before.status != after.status {
                notify(
                    after.id,
                    status_event(after.status),
                    json!({
                        "id": after.id,
                        "title": after.title,
                        "old_status": before.status,
                        "new_status": after.status,
                        "version": after.version,
                    }),
                )
            } else if before.title != after.title {
                notify(
                    after.id,
                    "document.updated",
                    json!({
                        "id": after.id,
                        "title": after.title,
                        "version": after.version,
                    }),
                )
            } else {
                None
            }
        }
        (ChangeKind::Delete, Some(EntitySnapshot::Document(doc)), _) => notify(
            doc.id,
            "document.deleted",
            json!({
                "id": doc.id,
                "title": doc.title,
            }),
        ),
        (ChangeKind::Create, _, Some(EntitySnapshot::Signature(sig))) => notify(
            sig.document_id,
            "signature.added",
            json!({
                "signature_id": sig.id,
                "document_id": sig.document_id,
                "signer_name": sig.signer_name,
                "signer_email": sig.signer_email,
                "signed_at": sig.signed_at,
            }),
        ),
        _ => None,
    }
}

/// Counters for the broadcaster.
#[derive(Debug, Default)]
pub struct BroadcasterStats {
    notifications: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`BroadcasterStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BroadcasterStatsSnapshot {
    pub notifications: u64,
    pub delivered: u64,
    pub dropped: u64,
}

impl BroadcasterStats {
    pub fn snapshot(&self) -> BroadcasterStatsSnapshot {
        BroadcasterStatsSnapshot {
            notifications: self.notifications.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Consumer-group handler that pushes notifications to live connections.
///
/// Delivery failures are per connection and never fail the batch, so the
/// group's cursor always advances past records it has seen.
pub struct Broadcaster {
    registry: ConnectionRegistry,
    stats: Arc<BroadcasterStats>,
}

impl Broadcaster {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry,
            stats: Arc::new(BroadcasterStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<BroadcasterStats> {
        Arc::clone(&self.stats)
    }
}

impl ChangeHandler for Broadcaster {
    fn handle_batch(&self, records: &[ChangeRecord]) -> Result<(), HandlerError> {
        for record in records {
            let Some((target, notification)) = notification_for(record) else {
                continue;
            };
            self.stats.notifications.fetch_add(1, Ordering::Relaxed);

            if self.registry.connection_count(target) == 0 {
                continue;
            }
            let message = match serde_json::to_string(&notification) {
                Ok(m) => m,
                Err(e) => {
                    tracing::error!(
                        entity_id = %target,
                        event_type = notification.event_type,
                        "failed to serialize notification: {}",
                        e
                    );
                    continue;
                }
            };

            let report = self.registry.deliver(target, &message);
            self.stats
                .delivered
                .fetch_add(report.delivered as u64, Ordering::Relaxed);
            self.stats
                .dropped
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
            tracing::debug!(
                entity_id = %target,
                event_type = notification.event_type,
                log_position = record.log_position,
                recipients = report.delivered,
                "broadcast notification"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::registry::ConnectionHandle;
    use chrono::{TimeZone, Utc};
    use signet_types::{Document, EntityType, Signature};
    use tokio::sync::mpsc;

    fn doc(id: Uuid, title: &str, status: DocumentStatus, version: i64) -> Document {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        Document {
            id,
            title: title.to_string(),
            content_type: "text/plain".to_string(),
            content_size: 5,
            content_reference: Some(format!("{id}/content")),
            content_digest: None,
            status,
            created_by: "alice@example.com".to_string(),
            created_at: at,
            updated_at: at,
            version,
        }
    }

    fn record(
        kind: ChangeKind,
        before: Option<EntitySnapshot>,
        after: Option<EntitySnapshot>,
    ) -> ChangeRecord {
        let latest = after.as_ref().or(before.as_ref()).unwrap();
        ChangeRecord {
            entity_type: match latest {
                EntitySnapshot::Document(_) => EntityType::Document,
                EntitySnapshot::Signature(_) => EntityType::Signature,
            },
            entity_id: latest.id(),
            kind,
            before,
            after,
            partition: 0,
            log_position: 7,
            transaction_id: "tx".to_string(),
            captured_at: Utc.timestamp_millis_opt(1_740_830_400_123).unwrap(),
        }
    }

    #[test]
    fn status_change_to_viewed() {
        let id = Uuid::new_v4();
        let r = record(
            ChangeKind::Update,
            Some(EntitySnapshot::Document(doc(id, "NDA", DocumentStatus::Created, 1))),
            Some(EntitySnapshot::Document(doc(id, "NDA", DocumentStatus::Viewed, 2))),
        );
        let (target, n) = notification_for(&r).unwrap();
        assert_eq!(target, id);
        assert_eq!(n.event_type, "document.viewed");
        assert_eq!(n.data["old_status"], "created");
        assert_eq!(n.data["new_status"], "viewed");
        assert_eq!(n.data["version"], 2);
        assert_eq!(n.timestamp, 1_740_830_400_123);
    }

    #[test]
    fn archive_uses_generic_status_event() {
        let id = Uuid::new_v4();
        let r = record(
            ChangeKind::Update,
            Some(EntitySnapshot::Document(doc(id, "NDA", DocumentStatus::Signed, 3))),
            Some(EntitySnapshot::Document(doc(id, "NDA", DocumentStatus::Archived, 4))),
        );
        assert_eq!(notification_for(&r).unwrap().1.event_type, "document.status_changed");
    }

    #[test]
    fn title_only_change() {
        let id = Uuid::new_v4();
        let r = record(
            ChangeKind::Update,
            Some(EntitySnapshot::Document(doc(id, "Draft", DocumentStatus::Sent, 2))),
            Some(EntitySnapshot::Document(doc(id, "Final", DocumentStatus::Sent, 3))),
        );
        let (_, n) = notification_for(&r).unwrap();
        assert_eq!(n.event_type, "document.updated");
        assert_eq!(n.data["title"], "Final");
    }

    #[test]
    fn silent_update_and_snapshot_produce_nothing() {
        let id = Uuid::new_v4();
        let before = doc(id, "NDA", DocumentStatus::Sent, 2);
        let mut after = before.clone();
        after.version = 3;
        after.content_size = 99;
        let update = record(
            ChangeKind::Update,
            Some(EntitySnapshot::Document(before.clone())),
            Some(EntitySnapshot::Document(after)),
        );
        assert!(notification_for(&update).is_none());

        let snapshot = record(ChangeKind::Snapshot, None, Some(EntitySnapshot::Document(before)));
        assert!(notification_for(&snapshot).is_none());
    }

    #[test]
    fn signature_targets_its_document() {
        let document_id = Uuid::new_v4();
        let sig = Signature {
            id: Uuid::new_v4(),
            document_id,
            signer_email: "bob@example.com".to_string(),
            signer_name: "Bob".to_string(),
            signed_at: Utc::now(),
            content_reference: None,
            ip_address: None,
            version: 1,
        };
        let r = record(ChangeKind::Create, None, Some(EntitySnapshot::Signature(sig.clone())));
        let (target, n) = notification_for(&r).unwrap();
        assert_eq!(target, document_id);
        assert_eq!(n.event_type, "signature.added");
        assert_eq!(n.data["signature_id"], sig.id.to_string());
        assert_eq!(n.data["signer_name"], "Bob");
    }

    #[test]
    fn delete_carries_last_title() {
        let id = Uuid::new_v4();
        let r = record(
            ChangeKind::Delete,
            Some(EntitySnapshot::Document(doc(id, "Lease", DocumentStatus::Archived, 5))),
            None,
        );
        let (_, n) = notification_for(&r).unwrap();
        assert_eq!(n.event_type, "document.deleted");
        assert_eq!(n.data["title"], "Lease");
    }

    #[test]
    fn batch_delivers_in_log_order_to_subscribers_only() {
        let registry = ConnectionRegistry::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = Arc::new(ConnectionHandle::new(id, tx));
        handle.begin_authentication();
        registry
            .subscribe(
                handle,
                Identity {
                    user_id: "u".to_string(),
                    email: None,
                },
            )
            .unwrap();

        let broadcaster = Broadcaster::new(registry);
        let other = Uuid::new_v4();
        let records = vec![
            record(
                ChangeKind::Create,
                None,
                Some(EntitySnapshot::Document(doc(id, "NDA", DocumentStatus::Created, 1))),
            ),
            record(
                ChangeKind::Create,
                None,
                Some(EntitySnapshot::Document(doc(other, "Other", DocumentStatus::Created, 1))),
            ),
            record(
                ChangeKind::Update,
                Some(EntitySnapshot::Document(doc(id, "NDA", DocumentStatus::Created, 1))),
                Some(EntitySnapshot::Document(doc(id, "NDA", DocumentStatus::Sent, 2))),
            ),
        ];
        broadcaster.handle_batch(&records).unwrap();

        let first: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let second: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["type"], "document.created");
        assert_eq!(second["type"], "document.sent");
        assert!(rx.try_recv().is_err());

        let stats = broadcaster.stats().snapshot();
        assert_eq!(stats.notifications, 3);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dropped, 0);
    }
}
