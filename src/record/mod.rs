pub mod memory;
pub mod update;

pub use memory::MemoryCollection;
pub use update::{SetTarget, UpdateDoc};

use crate::filter::Filter;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record store error: {0}")]
    Backend(String),

    #[error("transient record store error: {0}")]
    Transient(String),
}

/// CRUD handle for one document collection.
///
/// The engine never talks to a database directly; collections are injected
/// through the registry so tests can run against in-memory handles.
#[async_trait]
pub trait RecordCollection: Send + Sync {
    async fn insert(&self, doc: Value) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Value>, StoreError>;

    /// Returns every record matching the filter, in stable insertion order.
    async fn find(&self, filter: &Filter) -> Result<Vec<Value>, StoreError>;

    /// Applies the update to every matching record and returns how many
    /// records were modified.
    async fn update_many(&self, filter: &Filter, update: &UpdateDoc) -> Result<u64, StoreError>;

    /// Removes a record, returning it if it existed.
    async fn remove(&self, id: &str) -> Result<Option<Value>, StoreError>;
}

/// Retries `op` on transient store errors with a fixed backoff, up to
/// `attempts` total tries. Non-transient errors surface immediately.
pub async fn with_retry<T, F, Fut>(attempts: u32, backoff: Duration, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut tried = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(StoreError::Transient(msg)) => {
                tried += 1;
                if tried >= attempts {
                    return Err(StoreError::Transient(msg));
                }
                tracing::debug!(attempt = tried, error = %msg, "retrying transient store error");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Returns the record's `_id` as a string slice.
pub fn record_id(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

/// Resolves a dotted path to a single value. Arrays are not traversed; use
/// [`resolve_path`] for query-style matching.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Resolves a dotted path with array fan-out: when a segment lands on an
/// array, the remaining path is applied to every element. This mirrors how
/// document databases match `field._id` against list-typed lookup fields.
pub fn resolve_path<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    fn walk<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
        if let Value::Array(items) = value {
            for item in items {
                walk(item, segments, out);
            }
            return;
        }
        match segments.split_first() {
            None => out.push(value),
            Some((head, rest)) => {
                if let Some(next) = value.get(head) {
                    walk(next, rest, out);
                }
            }
        }
    }

    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    walk(doc, &segments, &mut out);
    out
}

/// Deep-picks the given dotted paths out of a record into a new object,
/// preserving nesting. Missing paths are skipped.
pub fn pick_paths(doc: &Value, paths: &[String]) -> Map<String, Value> {
    let mut out = Map::new();
    for path in paths {
        let Some(value) = get_path(doc, path) else {
            continue;
        };
        let mut segments = path.split('.').peekable();
        let mut target = &mut out;
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                target.insert(segment.to_string(), value.clone());
            } else {
                let entry = target
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                match entry {
                    Value::Object(map) => target = map,
                    _ => {
                        // A leaf already sits where a deeper path wants an
                        // object; the shallower pick wins.
                        break;
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_path_nested() {
        let doc = json!({"contact": {"_id": "c1", "name": "Alice"}});
        assert_eq!(get_path(&doc, "contact._id"), Some(&json!("c1")));
        assert_eq!(get_path(&doc, "contact.phone"), None);
    }

    #[test]
    fn test_resolve_path_fans_out_over_arrays() {
        let doc = json!({"tags": [{"_id": "a"}, {"_id": "b"}]});
        let found = resolve_path(&doc, "tags._id");
        assert_eq!(found, vec![&json!("a"), &json!("b")]);
    }

    #[test]
    fn test_pick_paths_deep() {
        let doc = json!({"_id": "x", "address": {"city": "Lisbon", "zip": "1000"}, "name": "N"});
        let picked = pick_paths(
            &doc,
            &["_id".to_string(), "address.city".to_string(), "missing".to_string()],
        );
        assert_eq!(
            Value::Object(picked),
            json!({"_id": "x", "address": {"city": "Lisbon"}})
        );
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_attempts() {
        let mut calls = 0u32;
        let result: Result<(), StoreError> = with_retry(3, Duration::from_millis(1), || {
            calls += 1;
            async { Err(StoreError::Transient("write conflict".into())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Transient(_))));
        assert_eq!(calls, 3);
    }
}
