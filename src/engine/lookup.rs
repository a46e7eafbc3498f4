use super::PropagationError;
use crate::change::{Change, Operation};
use crate::config::PropagationConfig;
use crate::filter::{first_segments, Filter};
use crate::metadata::{DocumentMeta, FieldType, InheritMode, LookupDef, LookupReference, Registry};
use crate::record::{pick_paths, record_id, with_retry, UpdateDoc};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

/// The frozen value stored in a lookup field: `_id` plus the description
/// field paths, deep-picked from the target record.
pub fn lookup_snapshot(def: &LookupDef, source: &Value) -> Value {
    let mut paths: Vec<String> = vec!["_id".to_string()];
    for path in &def.description_fields {
        if !paths.contains(path) {
            paths.push(path.clone());
        }
    }
    Value::Object(pick_paths(source, &paths))
}

fn reference_affected(def: &LookupDef, changed: &HashSet<&str>) -> bool {
    first_segments(&def.description_fields)
        .iter()
        .any(|segment| changed.contains(segment.as_str()))
        || def.inherited_fields.iter().any(|f| {
            f.inherit != InheritMode::Once && changed.contains(f.field_name.as_str())
        })
}

/// Refreshes lookup snapshots on every record referencing the changed one.
/// Runs only for updates; snapshots are frozen at write time for creates and
/// kept as-is for deletes.
pub async fn update_lookup_references(
    registry: &Registry,
    change: &Change,
    config: &PropagationConfig,
) -> Result<(), PropagationError> {
    if change.operation != Operation::Update {
        return Ok(());
    }

    let changed: HashSet<&str> = change.changed_keys().into_iter().collect();
    let references: Vec<LookupReference> = registry
        .references_to(&change.document)
        .into_iter()
        .filter(|r| {
            registry
                .lookup_field(&r.document, &r.field)
                .is_some_and(|(_, def)| reference_affected(def, &changed))
        })
        .collect();

    if references.is_empty() {
        return Ok(());
    }

    let collection = registry.collection(&change.document).ok_or_else(|| {
        PropagationError::Failed(format!("no collection bound for {}", change.document))
    })?;
    let source = with_retry(config.write_retry_attempts, config.write_retry_backoff, || {
        collection.find_by_id(&change.record_id)
    })
    .await?;
    let Some(source) = source else {
        debug!(
            document = %change.document,
            record_id = %change.record_id,
            "record gone before lookup refresh, skipping"
        );
        return Ok(());
    };

    let jobs = references.iter().map(|reference| {
        let source = source.clone();
        async move { refresh_reference(registry, change, reference, source, config).await }
    });

    stream::iter(jobs)
        .buffer_unordered(config.fanout_concurrency.max(1))
        .try_collect::<Vec<_>>()
        .await?;

    Ok(())
}

async fn refresh_reference(
    registry: &Registry,
    change: &Change,
    reference: &LookupReference,
    source: Value,
    config: &PropagationConfig,
) -> Result<(), PropagationError> {
    let Some(meta) = registry.document(&reference.document) else {
        return Ok(());
    };
    let Some((field_def, lookup_def)) = registry.lookup_field(&reference.document, &reference.field)
    else {
        return Ok(());
    };
    let Some(target_collection) = registry.collection(&reference.document) else {
        warn!(document = %reference.document, "no collection bound, skipping lookup refresh");
        return Ok(());
    };

    let snapshot = lookup_snapshot(lookup_def, &source);
    let mut update = if field_def.is_list {
        UpdateDoc::new().set_list_item(&reference.field, &change.record_id, snapshot)
    } else {
        UpdateDoc::new().set(&reference.field, snapshot)
    };

    let mut sets = Map::new();
    let mut visited = HashSet::new();
    visited.insert((change.document.clone(), change.record_id.clone()));
    collect_inherited(registry, meta, lookup_def, source, &mut sets, &mut visited, config).await?;
    for (field, value) in sets {
        update = update.set(field, value);
    }

    let filter = Filter::field_references(&reference.field, &change.record_id);
    let modified = with_retry(config.write_retry_attempts, config.write_retry_backoff, || {
        target_collection.update_many(&filter, &update)
    })
    .await?;

    if modified > 0 {
        debug!(
            source = %change.document,
            target = %reference.document,
            field = %reference.field,
            modified,
            "refreshed lookup references"
        );
    }

    Ok(())
}

/// Resolves the lookup's inherited fields against the (already updated)
/// source record into top-level `$set` values for the referencing record.
///
/// Inherited fields that are themselves lookups are re-resolved against the
/// current target record instead of copied verbatim, recursively. The
/// visited set breaks inheritance cycles; a cycle is a metadata error and the
/// offending branch is skipped.
pub(crate) fn collect_inherited<'a>(
    registry: &'a Registry,
    meta: &'a DocumentMeta,
    lookup_def: &'a LookupDef,
    source: Value,
    sets: &'a mut Map<String, Value>,
    visited: &'a mut HashSet<(String, String)>,
    config: &'a PropagationConfig,
) -> BoxFuture<'a, Result<(), PropagationError>> {
    async move {
        for inherited in &lookup_def.inherited_fields {
            if inherited.inherit == InheritMode::Once {
                continue;
            }

            let Some(target_def) = meta.fields.get(&inherited.field_name) else {
                warn!(
                    document = %meta.name,
                    field = %inherited.field_name,
                    "inherited field not defined, skipping"
                );
                continue;
            };

            let mut value = source
                .get(&inherited.field_name)
                .cloned()
                .unwrap_or(Value::Null);

            if inherited.inherit == InheritMode::HierarchyAlways {
                if target_def.field_type != FieldType::Lookup || !target_def.is_list {
                    warn!(
                        document = %meta.name,
                        field = %inherited.field_name,
                        "hierarchy inheritance requires a list lookup field, skipping"
                    );
                    continue;
                }
                // The chain gains the source record itself at the tail.
                let mut items = value.as_array().cloned().unwrap_or_default();
                if let Some(id) = record_id(&source) {
                    items.push(json!({ "_id": id }));
                }
                value = Value::Array(items);
            }

            let nested = match target_def.field_type {
                FieldType::Lookup => target_def.lookup.as_ref(),
                _ => None,
            };

            let Some(nested) = nested else {
                sets.insert(inherited.field_name.clone(), value);
                continue;
            };

            let Some(nested_collection) = registry.collection(&nested.target_document) else {
                warn!(document = %nested.target_document, "no collection bound, skipping inherited lookup");
                continue;
            };

            if target_def.is_list {
                let mut resolved = Vec::new();
                for item in value.as_array().into_iter().flatten() {
                    let Some(id) = item.get("_id").and_then(Value::as_str) else {
                        continue;
                    };
                    let record = with_retry(
                        config.write_retry_attempts,
                        config.write_retry_backoff,
                        || nested_collection.find_by_id(id),
                    )
                    .await?;
                    match record {
                        Some(record) => resolved.push(lookup_snapshot(nested, &record)),
                        None => warn!(
                            document = %nested.target_document,
                            record_id = %id,
                            "inherited lookup target not found"
                        ),
                    }
                }
                sets.insert(inherited.field_name.clone(), Value::Array(resolved));
            } else {
                let Some(id) = value.get("_id").and_then(Value::as_str).map(str::to_string)
                else {
                    continue;
                };
                if !visited.insert((nested.target_document.clone(), id.clone())) {
                    warn!(
                        document = %nested.target_document,
                        record_id = %id,
                        "inheritance cycle detected, skipping"
                    );
                    continue;
                }
                let record = with_retry(
                    config.write_retry_attempts,
                    config.write_retry_backoff,
                    || nested_collection.find_by_id(&id),
                )
                .await?;
                let Some(record) = record else {
                    warn!(
                        document = %nested.target_document,
                        record_id = %id,
                        "inherited lookup target not found"
                    );
                    continue;
                };
                sets.insert(inherited.field_name.clone(), lookup_snapshot(nested, &record));
                collect_inherited(registry, meta, nested, record, sets, visited, config).await?;
            }
        }
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FieldDef, InheritedField};
    use crate::record::{MemoryCollection, RecordCollection};
    use chrono::Utc;
    use std::sync::Arc;

    fn contact_lookup(reverse: Option<&str>) -> LookupDef {
        LookupDef {
            target_document: "Contact".into(),
            description_fields: vec!["name".into(), "address.city".into()],
            inherited_fields: vec![],
            reverse_lookup: reverse.map(str::to_string),
        }
    }

    fn update_change(document: &str, record_id: &str, fields: Value) -> Change {
        Change::new(
            document,
            Operation::Update,
            record_id,
            fields.as_object().unwrap().clone(),
            Utc::now(),
            None,
        )
    }

    async fn setup() -> (Registry, Arc<MemoryCollection>, Arc<MemoryCollection>) {
        let contacts = Arc::new(MemoryCollection::with_docs(vec![json!({
            "_id": "c1",
            "name": "Alice",
            "address": {"city": "Lisbon", "zip": "1000"}
        })]));
        let opportunities = Arc::new(MemoryCollection::with_docs(vec![
            json!({
                "_id": "o1",
                "contact": {"_id": "c1", "name": "Old Name"},
                "status": "open"
            }),
            json!({
                "_id": "o2",
                "contact": {"_id": "other", "name": "Keep"},
                "status": "open"
            }),
        ]));

        let mut registry = Registry::new();
        registry.add_document(DocumentMeta::new("Contact", "data.Contact"));
        registry.add_document(
            DocumentMeta::new("Opportunity", "data.Opportunity")
                .field(FieldDef::lookup("contact", contact_lookup(None))),
        );
        registry.bind_collection("Contact", contacts.clone());
        registry.bind_collection("Opportunity", opportunities.clone());
        (registry, contacts, opportunities)
    }

    #[tokio::test]
    async fn test_snapshot_refreshes_referencing_records() {
        let (registry, _, opportunities) = setup().await;
        let change = update_change("Contact", "c1", json!({"name": "Alice"}));

        update_lookup_references(&registry, &change, &PropagationConfig::default())
            .await
            .unwrap();

        let o1 = opportunities.find_by_id("o1").await.unwrap().unwrap();
        assert_eq!(
            o1["contact"],
            json!({"_id": "c1", "name": "Alice", "address": {"city": "Lisbon"}})
        );
        // Unrelated reference untouched.
        let o2 = opportunities.find_by_id("o2").await.unwrap().unwrap();
        assert_eq!(o2["contact"]["name"], json!("Keep"));
    }

    #[tokio::test]
    async fn test_unrelated_change_is_skipped() {
        let (registry, _, opportunities) = setup().await;
        let change = update_change("Contact", "c1", json!({"phone": "123"}));

        update_lookup_references(&registry, &change, &PropagationConfig::default())
            .await
            .unwrap();

        let o1 = opportunities.find_by_id("o1").await.unwrap().unwrap();
        assert_eq!(o1["contact"]["name"], json!("Old Name"));
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let (registry, _, opportunities) = setup().await;
        let change = update_change("Contact", "c1", json!({"name": "Alice"}));
        let config = PropagationConfig::default();

        update_lookup_references(&registry, &change, &config).await.unwrap();
        let after_first = opportunities.find_by_id("o1").await.unwrap().unwrap();
        update_lookup_references(&registry, &change, &config).await.unwrap();
        let after_second = opportunities.find_by_id("o1").await.unwrap().unwrap();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_list_lookup_replaces_matching_element_only() {
        let contacts = Arc::new(MemoryCollection::with_docs(vec![json!({
            "_id": "c1",
            "name": "Alice"
        })]));
        let groups = Arc::new(MemoryCollection::with_docs(vec![json!({
            "_id": "g1",
            "members": [
                {"_id": "c1", "name": "Old"},
                {"_id": "c2", "name": "Other"}
            ]
        })]));

        let mut registry = Registry::new();
        registry.add_document(DocumentMeta::new("Contact", "data.Contact"));
        registry.add_document(DocumentMeta::new("Group", "data.Group").field(
            FieldDef::lookup(
                "members",
                LookupDef {
                    target_document: "Contact".into(),
                    description_fields: vec!["name".into()],
                    inherited_fields: vec![],
                    reverse_lookup: None,
                },
            )
            .list(),
        ));
        registry.bind_collection("Contact", contacts);
        registry.bind_collection("Group", groups.clone());

        let change = update_change("Contact", "c1", json!({"name": "Alice"}));
        update_lookup_references(&registry, &change, &PropagationConfig::default())
            .await
            .unwrap();

        let g1 = groups.find_by_id("g1").await.unwrap().unwrap();
        assert_eq!(g1["members"][0], json!({"_id": "c1", "name": "Alice"}));
        assert_eq!(g1["members"][1]["name"], json!("Other"));
    }

    #[tokio::test]
    async fn test_inherited_plain_field_is_copied() {
        let campaigns = Arc::new(MemoryCollection::with_docs(vec![json!({
            "_id": "p1",
            "name": "Spring",
            "segment": "b2b"
        })]));
        let leads = Arc::new(MemoryCollection::with_docs(vec![json!({
            "_id": "l1",
            "campaign": {"_id": "p1", "name": "Old"},
            "segment": "stale"
        })]));

        let mut registry = Registry::new();
        registry.add_document(DocumentMeta::new("Campaign", "data.Campaign"));
        registry.add_document(
            DocumentMeta::new("Lead", "data.Lead")
                .field(FieldDef::lookup(
                    "campaign",
                    LookupDef {
                        target_document: "Campaign".into(),
                        description_fields: vec!["name".into()],
                        inherited_fields: vec![InheritedField {
                            field_name: "segment".into(),
                            inherit: InheritMode::Always,
                        }],
                        reverse_lookup: None,
                    },
                ))
                .field(FieldDef::text("segment")),
        );
        registry.bind_collection("Campaign", campaigns);
        registry.bind_collection("Lead", leads.clone());

        let change = update_change("Campaign", "p1", json!({"segment": "b2b"}));
        update_lookup_references(&registry, &change, &PropagationConfig::default())
            .await
            .unwrap();

        let l1 = leads.find_by_id("l1").await.unwrap().unwrap();
        assert_eq!(l1["segment"], json!("b2b"));
    }

    #[tokio::test]
    async fn test_hierarchy_inheritance_appends_source_and_survives_cycles() {
        // parent chain: root <- mid <- leaf, where "parents" is inherited as
        // hierarchy. A cycle (root points at leaf) must not hang.
        let groups = Arc::new(MemoryCollection::with_docs(vec![
            json!({"_id": "root", "name": "Root", "parent": {"_id": "leaf"}, "parents": []}),
            json!({"_id": "mid", "name": "Mid", "parent": {"_id": "root", "name": "Root"}, "parents": [{"_id": "root"}]}),
            json!({"_id": "leaf", "name": "Leaf", "parent": {"_id": "mid", "name": "Mid"}}),
        ]));

        let mut registry = Registry::new();
        registry.add_document(
            DocumentMeta::new("Group", "data.Group")
                .field(FieldDef::lookup(
                    "parent",
                    LookupDef {
                        target_document: "Group".into(),
                        description_fields: vec!["name".into()],
                        inherited_fields: vec![InheritedField {
                            field_name: "parents".into(),
                            inherit: InheritMode::HierarchyAlways,
                        }],
                        reverse_lookup: None,
                    },
                ))
                .field(
                    FieldDef::lookup(
                        "parents",
                        LookupDef {
                            target_document: "Group".into(),
                            description_fields: vec!["name".into()],
                            inherited_fields: vec![],
                            reverse_lookup: None,
                        },
                    )
                    .list(),
                ),
        );
        registry.bind_collection("Group", groups.clone());

        let change = update_change("Group", "mid", json!({"name": "Mid", "parents": [{"_id": "root"}]}));
        update_lookup_references(&registry, &change, &PropagationConfig::default())
            .await
            .unwrap();

        let leaf = groups.find_by_id("leaf").await.unwrap().unwrap();
        let parents = leaf["parents"].as_array().unwrap();
        let ids: Vec<&str> = parents
            .iter()
            .map(|p| p["_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["root", "mid"]);
        // Chain entries carry resolved description fields.
        assert_eq!(parents[0]["name"], json!("Root"));
    }
}
