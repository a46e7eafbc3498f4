use super::{Actor, Change, Operation, VOLATILE_FIELDS};
use crate::metadata::Registry;
use crate::storage::{ChangeQueue, StorageError, WatermarkStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("change feed error: {0}")]
    Feed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Insert,
    Update,
}

/// One event from the database's change feed, already reduced to what
/// capture needs: namespace, operation kind, document key, and either the
/// full new document (insert) or a field-level delta (update).
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Physical collection namespace (primary or `.Trash`).
    pub collection: String,
    pub kind: RawEventKind,
    pub record_id: String,
    /// Full document for inserts.
    pub full_document: Option<Value>,
    /// Set-map for updates. A feed that cannot produce field-level deltas may
    /// send the full document here; propagation degrades to treating every
    /// field as possibly changed, which is safe.
    pub updated_fields: Option<Map<String, Value>>,
    /// Fields removed by an update; they become `Null` in the change.
    pub removed_fields: Vec<String>,
    pub ts: DateTime<Utc>,
}

/// Source of raw change-feed events: a recovery query plus a live tail.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// All events with a source timestamp strictly after `since`, oldest
    /// first. Used once at startup to close the restart gap.
    async fn events_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RawEvent>, CaptureError>;

    /// Next live event; `None` means the feed closed.
    async fn next(&mut self) -> Result<Option<RawEvent>, CaptureError>;
}

/// Normalizes raw feed events into canonical [`Change`]s and enqueues them.
pub struct ChangeCapture {
    registry: Arc<Registry>,
    queue: Arc<dyn ChangeQueue>,
    notify: Arc<Notify>,
}

impl ChangeCapture {
    pub fn new(registry: Arc<Registry>, queue: Arc<dyn ChangeQueue>, notify: Arc<Notify>) -> Self {
        Self {
            registry,
            queue,
            notify,
        }
    }

    /// Maps a raw event to a canonical change. Returns `None` for events that
    /// are dropped by design: unmappable collections (schema may be
    /// mid-migration) and operations the engine does not track.
    pub fn map_event(&self, event: &RawEvent) -> Option<Change> {
        let is_trash = event.collection.ends_with(".Trash");
        let Some(meta) = self.registry.document_by_collection(&event.collection) else {
            debug!(collection = %event.collection, "dropping event for unmapped collection");
            return None;
        };

        let (operation, mut changed_fields) = match (event.kind, is_trash) {
            (RawEventKind::Insert, true) => (Operation::Delete, full_document_fields(event)),
            (RawEventKind::Insert, false) => (Operation::Create, full_document_fields(event)),
            (RawEventKind::Update, true) => {
                debug!(collection = %event.collection, "dropping update on trash collection");
                return None;
            }
            (RawEventKind::Update, false) => {
                let mut fields = event.updated_fields.clone().unwrap_or_default();
                for removed in &event.removed_fields {
                    fields.insert(removed.clone(), Value::Null);
                }
                (Operation::Update, fields)
            }
        };

        // The actor comes from the volatile audit stamps, so it is read
        // before they are dropped from the change.
        let actor = extract_actor(operation, &changed_fields);
        changed_fields.retain(|key, _| !VOLATILE_FIELDS.contains(&key.as_str()));

        Some(Change::new(
            &meta.name,
            operation,
            &event.record_id,
            changed_fields,
            event.ts,
            actor,
        ))
    }

    /// Normalizes and enqueues one event. Returns whether a new change was
    /// enqueued (`false` for drops and deduplicated replays).
    pub async fn ingest(&self, event: &RawEvent) -> Result<bool, CaptureError> {
        let Some(change) = self.map_event(event) else {
            return Ok(false);
        };
        let inserted = self.queue.enqueue(&change).await?;
        if inserted {
            debug!(
                change_id = %change.id,
                document = %change.document,
                operation = change.operation.as_str(),
                record_id = %change.record_id,
                "enqueued change"
            );
            self.notify.notify_one();
        } else {
            debug!(change_id = %change.id, "change already queued, deduplicated");
        }
        Ok(inserted)
    }

    pub fn watched(&self, collection: &str) -> bool {
        self.registry.document_by_collection(collection).is_some()
    }
}

fn full_document_fields(event: &RawEvent) -> Map<String, Value> {
    match &event.full_document {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

fn extract_actor(operation: Operation, fields: &Map<String, Value>) -> Option<Actor> {
    let keys: &[&str] = match operation {
        Operation::Create => &["_createdBy", "_updatedBy"],
        Operation::Update => &["_updatedBy"],
        Operation::Delete => &["_deletedBy", "_updatedBy"],
    };
    keys.iter()
        .filter_map(|k| fields.get(*k))
        .find_map(Actor::from_value)
}

/// Runs change capture: replays missed events after the stored watermark
/// (recovery path), then tails the live feed until it closes. Duplicate
/// deliveries from the replay/live overlap collide on the deterministic id.
pub async fn run_capture(
    mut feed: Box<dyn ChangeFeed>,
    capture: Arc<ChangeCapture>,
    watermark: Arc<dyn WatermarkStore>,
) -> Result<(), CaptureError> {
    let since = watermark.load().await?;
    let backlog = feed.events_since(since).await?;
    let mut recovered = 0u64;
    for event in &backlog {
        if capture.ingest(event).await? {
            recovered += 1;
        }
    }
    if recovered > 0 {
        info!(recovered, "replayed change feed backlog after restart");
    }

    info!("change capture attached to live feed");
    while let Some(event) = feed.next().await? {
        capture.ingest(&event).await?;
    }

    info!("change feed closed, capture stopping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::DocumentMeta;
    use crate::storage::MemoryBackend;
    use serde_json::json;

    fn capture_fixture() -> (Arc<ChangeCapture>, Arc<MemoryBackend>) {
        let mut registry = Registry::new();
        registry.add_document(DocumentMeta::new("Contact", "data.Contact"));
        let backend = Arc::new(MemoryBackend::new());
        let capture = ChangeCapture::new(
            Arc::new(registry),
            backend.clone(),
            Arc::new(Notify::new()),
        );
        (Arc::new(capture), backend)
    }

    fn insert_event(collection: &str, id: &str, doc: Value) -> RawEvent {
        RawEvent {
            collection: collection.to_string(),
            kind: RawEventKind::Insert,
            record_id: id.to_string(),
            full_document: Some(doc),
            updated_fields: None,
            removed_fields: vec![],
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_on_primary_maps_to_create() {
        let (capture, _) = capture_fixture();
        let event = insert_event(
            "data.Contact",
            "c1",
            json!({"_id": "c1", "name": "Alice", "_createdBy": {"_id": "u1"}}),
        );
        let change = capture.map_event(&event).unwrap();
        assert_eq!(change.operation, Operation::Create);
        assert_eq!(change.document, "Contact");
        assert_eq!(change.actor.as_ref().unwrap().id, "u1");
    }

    #[tokio::test]
    async fn test_insert_on_trash_maps_to_delete() {
        let (capture, _) = capture_fixture();
        let event = insert_event(
            "data.Contact.Trash",
            "c1",
            json!({"_id": "c1", "name": "Alice", "_deletedBy": {"_id": "u2"}}),
        );
        let change = capture.map_event(&event).unwrap();
        assert_eq!(change.operation, Operation::Delete);
        assert_eq!(change.actor.as_ref().unwrap().id, "u2");
    }

    #[tokio::test]
    async fn test_audit_stamps_feed_the_actor_but_not_the_change() {
        let (capture, _) = capture_fixture();
        let event = insert_event(
            "data.Contact",
            "c1",
            json!({
                "_id": "c1",
                "name": "Alice",
                "_createdBy": {"_id": "u1", "name": "Root"},
                "_createdAt": "2026-08-30T10:00:00Z",
                "_updatedAt": "2026-08-30T10:00:00Z"
            }),
        );
        let change = capture.map_event(&event).unwrap();
        assert_eq!(change.actor.as_ref().unwrap().id, "u1");
        assert_eq!(change.changed_fields["name"], json!("Alice"));
        assert!(!change.changed_fields.contains_key("_createdBy"));
        assert!(!change.changed_fields.contains_key("_createdAt"));
        assert!(!change.changed_fields.contains_key("_updatedAt"));
    }

    #[tokio::test]
    async fn test_update_merges_removed_fields_as_null() {
        let (capture, _) = capture_fixture();
        let event = RawEvent {
            collection: "data.Contact".into(),
            kind: RawEventKind::Update,
            record_id: "c1".into(),
            full_document: None,
            updated_fields: Some(
                json!({"name": "Alicia"}).as_object().unwrap().clone(),
            ),
            removed_fields: vec!["phone".into()],
            ts: Utc::now(),
        };
        let change = capture.map_event(&event).unwrap();
        assert_eq!(change.operation, Operation::Update);
        assert_eq!(change.changed_fields["name"], json!("Alicia"));
        assert_eq!(change.changed_fields["phone"], Value::Null);
    }

    #[tokio::test]
    async fn test_unmapped_collection_is_dropped() {
        let (capture, _) = capture_fixture();
        let event = insert_event("data.Unknown", "x", json!({"_id": "x"}));
        assert!(capture.map_event(&event).is_none());
        assert!(!capture.ingest(&event).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_deduplicates() {
        let (capture, _backend) = capture_fixture();
        let event = insert_event("data.Contact", "c1", json!({"_id": "c1", "name": "A"}));
        assert!(capture.ingest(&event).await.unwrap());
        assert!(!capture.ingest(&event).await.unwrap());
    }
}
