use super::lookup::{collect_inherited, lookup_snapshot};
use super::PropagationError;
use crate::change::{Change, Operation};
use crate::config::PropagationConfig;
use crate::filter::{Filter, Operator};
use crate::metadata::Registry;
use crate::record::{with_retry, UpdateDoc};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Ids referenced by a lookup value: the `_id` of a single snapshot, or the
/// `_id`s of every element for list values.
pub(crate) fn lookup_ids(value: &Value) -> Vec<String> {
    let mut ids = Vec::new();
    match value {
        Value::Array(items) => {
            for item in items {
                if let Some(id) = item.get("_id").and_then(Value::as_str) {
                    ids.push(id.to_string());
                }
            }
        }
        Value::Object(_) => {
            if let Some(id) = value.get("_id").and_then(Value::as_str) {
                ids.push(id.to_string());
            }
        }
        _ => {}
    }
    ids.sort();
    ids.dedup();
    ids
}

/// Keeps reverse lookup fields in sync with their forward counterparts: for
/// every changed lookup field declaring a `reverse_lookup`, drop the back
/// reference from previous targets and install it on the new one. Deletes are
/// skipped; the forward reference survives as a historical snapshot.
pub async fn process_reverse_lookups(
    registry: &Registry,
    change: &Change,
    config: &PropagationConfig,
) -> Result<(), PropagationError> {
    if change.operation == Operation::Delete {
        return Ok(());
    }
    let Some(meta) = registry.document(&change.document) else {
        return Ok(());
    };

    let affected: Vec<_> = meta
        .lookup_fields()
        .filter(|(f, l)| l.reverse_lookup.is_some() && change.changed_fields.contains_key(&f.name))
        .collect();
    if affected.is_empty() {
        return Ok(());
    }

    // The full source record backs the snapshot installed on new targets.
    let source = match registry.collection(&change.document) {
        Some(collection) => {
            with_retry(config.write_retry_attempts, config.write_retry_backoff, || {
                collection.find_by_id(&change.record_id)
            })
            .await?
        }
        None => None,
    };

    for (field_def, lookup_def) in affected {
        let reverse_field = lookup_def.reverse_lookup.as_deref().unwrap_or_default();
        let Some(target_meta) = registry.document(&lookup_def.target_document) else {
            warn!(document = %lookup_def.target_document, "reverse lookup target document unknown");
            continue;
        };
        let Some(reverse_def) = target_meta.fields.get(reverse_field) else {
            warn!(
                document = %target_meta.name,
                field = %reverse_field,
                "reverse lookup field not defined"
            );
            continue;
        };
        let Some(target_collection) = registry.collection(&lookup_def.target_document) else {
            warn!(document = %lookup_def.target_document, "no collection bound for reverse lookup");
            continue;
        };

        let new_value = change
            .changed_fields
            .get(&field_def.name)
            .cloned()
            .unwrap_or(Value::Null);
        let new_ids = lookup_ids(&new_value);

        // Drop the back reference everywhere except the new target(s).
        let mut removal = Filter::and().condition(
            format!("{reverse_field}._id"),
            Operator::Equals,
            json!(change.record_id),
        );
        if !new_ids.is_empty() {
            removal = removal.condition("_id", Operator::NotIn, json!(new_ids));
        }
        let removal_update = if reverse_def.is_list {
            UpdateDoc::new().pull(reverse_field, &change.record_id)
        } else {
            UpdateDoc::new().unset(reverse_field)
        };
        let removed = with_retry(config.write_retry_attempts, config.write_retry_backoff, || {
            target_collection.update_many(&removal, &removal_update)
        })
        .await?;
        if removed > 0 {
            debug!(
                document = %target_meta.name,
                field = %reverse_field,
                removed,
                "removed stale reverse lookups"
            );
        }

        if new_ids.is_empty() {
            continue;
        }
        let Some(source) = &source else {
            warn!(
                document = %change.document,
                record_id = %change.record_id,
                "record gone before reverse lookup install, skipping"
            );
            continue;
        };
        let Some(reverse_lookup_def) = reverse_def.lookup.as_ref() else {
            warn!(
                document = %target_meta.name,
                field = %reverse_field,
                "reverse lookup field is not a lookup"
            );
            continue;
        };

        let snapshot = lookup_snapshot(reverse_lookup_def, source);
        let mut install = if reverse_def.is_list {
            UpdateDoc::new().push(reverse_field, snapshot)
        } else {
            UpdateDoc::new().set(reverse_field, snapshot)
        };
        let mut sets = Map::new();
        let mut visited = HashSet::new();
        visited.insert((change.document.clone(), change.record_id.clone()));
        collect_inherited(
            registry,
            target_meta,
            reverse_lookup_def,
            source.clone(),
            &mut sets,
            &mut visited,
            config,
        )
        .await?;
        for (field, value) in sets {
            install = install.set(field, value);
        }

        for id in &new_ids {
            let mut filter = Filter::by_id(id);
            if reverse_def.is_list {
                // Guard against double-push on replay.
                filter = filter.condition(
                    format!("{reverse_field}._id"),
                    Operator::NotEquals,
                    json!(change.record_id),
                );
            }
            let installed =
                with_retry(config.write_retry_attempts, config.write_retry_backoff, || {
                    target_collection.update_many(&filter, &install)
                })
                .await?;
            if installed > 0 {
                debug!(
                    document = %target_meta.name,
                    field = %reverse_field,
                    target_id = %id,
                    "installed reverse lookup"
                );
            }
        }
    }

    Ok(())
}
