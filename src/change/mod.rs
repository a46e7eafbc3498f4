pub mod capture;

pub use capture::{run_capture, CaptureError, ChangeCapture, ChangeFeed, RawEvent, RawEventKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Audit fields maintained by the write path. They never participate in
/// propagation decisions and are stripped from history diffs.
pub const VOLATILE_FIELDS: &[&str] = &[
    "_updatedAt",
    "_createdAt",
    "_deletedAt",
    "_updatedBy",
    "_createdBy",
    "_deletedBy",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation {other}")),
        }
    }
}

/// Stub of the user that caused a mutation; carried into history entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub group: Option<Value>,
}

impl Actor {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Canonical, queued representation of one mutation on a watched collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub document: String,
    pub operation: Operation,
    pub record_id: String,
    /// Sparse field → new value map; `Null` means the field was unset.
    /// Near-full document for create/delete.
    pub changed_fields: Map<String, Value>,
    pub ts: DateTime<Utc>,
    pub actor: Option<Actor>,
    #[serde(default)]
    pub process_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Change {
    pub fn new(
        document: &str,
        operation: Operation,
        record_id: &str,
        changed_fields: Map<String, Value>,
        ts: DateTime<Utc>,
        actor: Option<Actor>,
    ) -> Self {
        Self {
            id: deterministic_id(document, record_id, ts),
            document: document.to_string(),
            operation,
            record_id: record_id.to_string(),
            changed_fields,
            ts,
            actor,
            process_started_at: None,
            processed_at: None,
            error_count: 0,
            last_error: None,
        }
    }

    /// Top-level names of the fields this change touched.
    pub fn changed_keys(&self) -> Vec<&str> {
        self.changed_fields.keys().map(String::as_str).collect()
    }
}

/// Deterministic change id: the same source event always maps to the same id,
/// so replayed deliveries collide on insert instead of double-processing.
pub fn deterministic_id(document: &str, record_id: &str, ts: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(record_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(ts.timestamp_micros().to_be_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deterministic_id_is_stable_and_distinct() {
        let ts = Utc::now();
        let a = deterministic_id("Contact", "c1", ts);
        let b = deterministic_id("Contact", "c1", ts);
        let c = deterministic_id("Contact", "c2", ts);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_actor_parses_stub() {
        let actor = Actor::from_value(&json!({"_id": "u1", "name": "Ops", "group": {"name": "admin"}})).unwrap();
        assert_eq!(actor.id, "u1");
        assert_eq!(actor.name.as_deref(), Some("Ops"));
    }
}
