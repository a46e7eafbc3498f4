use super::PropagationError;
use crate::change::{Change, VOLATILE_FIELDS};
use crate::metadata::Registry;
use crate::storage::{HistoryEntry, HistoryStore};
use serde_json::{Map, Value};

/// Records the change's filtered diff as a history entry. Returns whether an
/// entry was written; documents without `save_history` and changes whose diff
/// is empty after filtering are no-ops.
pub async fn record_change(
    registry: &Registry,
    history: &dyn HistoryStore,
    change: &Change,
) -> Result<bool, PropagationError> {
    let Some(meta) = registry.document(&change.document) else {
        return Ok(false);
    };
    if !meta.save_history {
        return Ok(false);
    }

    let mut data = Map::new();
    for (key, value) in &change.changed_fields {
        if VOLATILE_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if meta.fields.get(key).is_some_and(|f| f.ignore_history) {
            continue;
        }
        data.insert(key.clone(), value.clone());
    }

    if data.is_empty() {
        return Ok(false);
    }

    let entry = HistoryEntry {
        // Keyed by the change id so replays overwrite instead of duplicating.
        id: change.id.clone(),
        document: change.document.clone(),
        record_id: change.record_id.clone(),
        kind: change.operation,
        created_at: change.ts,
        created_by: change
            .actor
            .as_ref()
            .map(|a| a.to_value())
            .unwrap_or(Value::Null),
        data,
    };

    history.append(&entry).await?;
    Ok(true)
}
