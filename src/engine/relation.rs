use super::reverse::lookup_ids;
use super::PropagationError;
use crate::change::{Change, Operation};
use crate::config::PropagationConfig;
use crate::filter::{first_segments, Filter, Operator};
use crate::metadata::{Aggregator, AggregatorOp, DocumentMeta, FieldType, Registry, Relation};
use crate::record::{get_path, resolve_path, with_retry, UpdateDoc};
use crate::storage::HistoryStore;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

fn relation_affected(relation: &Relation, changed: &HashSet<&str>) -> bool {
    if changed.contains(relation.lookup.as_str()) {
        return true;
    }
    if let Some(filter) = &relation.filter {
        if first_segments(&filter.terms())
            .iter()
            .any(|s| changed.contains(s.as_str()))
        {
            return true;
        }
    }
    relation.aggregators.values().any(|a| {
        a.field
            .as_deref()
            .and_then(|f| f.split('.').next())
            .is_some_and(|s| changed.contains(s))
    })
}

/// Recomputes relation aggregates on every target the changed record
/// contributes to. On update of the lookup field itself the previous
/// target(s) are resolved from history and recomputed too, so the record's
/// contribution moves instead of double-counting.
pub async fn update_relation_references(
    registry: &Registry,
    history: &dyn HistoryStore,
    change: &Change,
    config: &PropagationConfig,
) -> Result<(), PropagationError> {
    let relations = registry.relations_pointing_at(&change.document);
    if relations.is_empty() {
        return Ok(());
    }

    let changed: HashSet<&str> = change.changed_keys().into_iter().collect();
    let affected: Vec<_> = relations
        .into_iter()
        .filter(|(_, relation)| {
            change.operation != Operation::Update || relation_affected(relation, &changed)
        })
        .collect();
    if affected.is_empty() {
        return Ok(());
    }

    // Aggregates are computed from the record's full state, which for deletes
    // survives only in the trash collection.
    let record = match change.operation {
        Operation::Create => Some(Value::Object(change.changed_fields.clone())),
        Operation::Delete => {
            let from_trash = match registry.trash_collection(&change.document) {
                Some(trash) => {
                    with_retry(config.write_retry_attempts, config.write_retry_backoff, || {
                        trash.find_by_id(&change.record_id)
                    })
                    .await?
                }
                None => None,
            };
            Some(from_trash.unwrap_or(Value::Object(change.changed_fields.clone())))
        }
        Operation::Update => match registry.collection(&change.document) {
            Some(collection) => {
                with_retry(config.write_retry_attempts, config.write_retry_backoff, || {
                    collection.find_by_id(&change.record_id)
                })
                .await?
            }
            None => None,
        },
    };
    let Some(record) = record else {
        warn!(
            document = %change.document,
            record_id = %change.record_id,
            "record gone before relation recompute, skipping"
        );
        return Ok(());
    };

    let mut errors = Vec::new();
    for (declaring_meta, relation) in affected {
        let mut targets: BTreeSet<String> = get_path(&record, &relation.lookup)
            .map(lookup_ids)
            .unwrap_or_default()
            .into_iter()
            .collect();

        // When the lookup itself changed, the record stopped contributing to
        // its previous target(s); find them through history.
        if change.operation == Operation::Update
            && change.changed_fields.contains_key(&relation.lookup)
        {
            if let Some(entry) = history
                .last_touching(&change.document, &change.record_id, &relation.lookup)
                .await?
            {
                if let Some(previous) = entry.data.get(&relation.lookup) {
                    targets.extend(lookup_ids(previous));
                }
            }
        }

        for target in &targets {
            if let Err(e) =
                recompute_target(registry, declaring_meta, relation, target, config).await
            {
                error!(
                    declaring = %declaring_meta.name,
                    contributing = %relation.document,
                    target_id = %target,
                    error = %e,
                    "relation aggregate recompute failed"
                );
                errors.push(format!(
                    "{} <- {} [{}]: {}",
                    declaring_meta.name, relation.document, target, e
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(PropagationError::Failed(errors.join("; ")))
    }
}

async fn recompute_target(
    registry: &Registry,
    declaring_meta: &DocumentMeta,
    relation: &Relation,
    target_id: &str,
    config: &PropagationConfig,
) -> Result<u64, PropagationError> {
    let contributing = registry.collection(&relation.document).ok_or_else(|| {
        PropagationError::Failed(format!("no collection bound for {}", relation.document))
    })?;
    let declaring = registry.collection(&declaring_meta.name).ok_or_else(|| {
        PropagationError::Failed(format!("no collection bound for {}", declaring_meta.name))
    })?;

    let mut query = Filter::and().condition(
        format!("{}._id", relation.lookup),
        Operator::Equals,
        json!(target_id),
    );
    if let Some(filter) = &relation.filter {
        query = query.nested(filter.clone());
    }

    let mut docs = with_retry(config.write_retry_attempts, config.write_retry_backoff, || {
        contributing.find(&query)
    })
    .await?;
    // Stable order so first/last aggregates are deterministic.
    docs.sort_by(|a, b| {
        let key = |d: &Value| {
            (
                d.get("_createdAt")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                d.get("_id").and_then(Value::as_str).unwrap_or_default().to_string(),
            )
        };
        key(a).cmp(&key(b))
    });

    let contributing_meta = registry.document(&relation.document);
    let mut update = UpdateDoc::new();
    for (out_field, aggregator) in &relation.aggregators {
        let field_type = aggregator
            .field
            .as_deref()
            .and_then(|f| f.split('.').next())
            .and_then(|first| contributing_meta.and_then(|m| m.fields.get(first)))
            .map(|f| f.field_type)
            .unwrap_or_default();

        match compute_aggregate(aggregator, field_type, &docs) {
            Some(value) => update = update.set(out_field, value),
            // Empty result unsets the output instead of writing zero.
            None => update = update.unset(out_field),
        }
    }

    if update.is_empty() {
        return Ok(0);
    }

    let filter = Filter::by_id(target_id);
    let modified = with_retry(config.write_retry_attempts, config.write_retry_backoff, || {
        declaring.update_many(&filter, &update)
    })
    .await?;
    if modified > 0 {
        info!(
            declaring = %declaring_meta.name,
            contributing = %relation.document,
            target_id = %target_id,
            modified,
            "updated relation aggregates"
        );
        for (field, aggregator) in &relation.aggregators {
            debug!(
                field = %field,
                op = ?aggregator.op,
                source = aggregator.field.as_deref().unwrap_or(""),
                "aggregate recomputed"
            );
        }
    }

    Ok(modified)
}

/// Computes one aggregate over the matched contributing records, already in
/// stable order. `None` means "no value"; the caller unsets the output field.
fn compute_aggregate(
    aggregator: &Aggregator,
    field_type: FieldType,
    docs: &[Value],
) -> Option<Value> {
    if aggregator.op == AggregatorOp::Count {
        if docs.is_empty() {
            return None;
        }
        return Some(json!(docs.len()));
    }

    let field = match aggregator.field.as_deref() {
        Some(field) => field,
        None => {
            warn!(op = ?aggregator.op, "aggregator without source field, skipping");
            return None;
        }
    };

    // Money fields aggregate their numeric part; the currency of the first
    // contributing record rides along.
    let (value_path, currency) = if field_type == FieldType::Money {
        let value_path = if field.ends_with(".value") {
            field.to_string()
        } else {
            format!("{field}.value")
        };
        let currency_path = format!(
            "{}.currency",
            value_path.trim_end_matches(".value")
        );
        let currency = docs
            .iter()
            .filter_map(|d| get_path(d, &currency_path))
            .find(|v| !v.is_null())
            .cloned();
        (value_path, currency)
    } else {
        (field.to_string(), None)
    };

    if aggregator.op == AggregatorOp::AddToSet {
        let collected = add_to_set(field_type, &value_path, docs);
        return if collected.is_empty() {
            None
        } else {
            Some(Value::Array(collected))
        };
    }

    let values: Vec<&Value> = docs
        .iter()
        .filter_map(|d| get_path(d, &value_path))
        .filter(|v| !v.is_null())
        .collect();
    if values.is_empty() {
        return None;
    }

    let result = match aggregator.op {
        AggregatorOp::Sum => number_value(values.iter().filter_map(|v| v.as_f64()).sum()),
        AggregatorOp::Avg => {
            let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
            if numbers.is_empty() {
                return None;
            }
            number_value(numbers.iter().sum::<f64>() / numbers.len() as f64)
        }
        AggregatorOp::Min => pick_extreme(&values, std::cmp::Ordering::Less)?,
        AggregatorOp::Max => pick_extreme(&values, std::cmp::Ordering::Greater)?,
        AggregatorOp::First => (*values.first()?).clone(),
        AggregatorOp::Last => (*values.last()?).clone(),
        AggregatorOp::Count | AggregatorOp::AddToSet => unreachable!(),
    };

    if field_type == FieldType::Money {
        Some(json!({ "currency": currency, "value": result }))
    } else {
        Some(result)
    }
}

fn add_to_set(field_type: FieldType, path: &str, docs: &[Value]) -> Vec<Value> {
    let mut collected = Vec::new();
    if field_type == FieldType::Lookup {
        // Group by target id, first snapshot wins; list fields are unwound.
        let mut seen = HashSet::new();
        for doc in docs {
            for item in resolve_path(doc, path) {
                let Some(id) = item.get("_id").and_then(Value::as_str) else {
                    continue;
                };
                if seen.insert(id.to_string()) {
                    collected.push(item.clone());
                }
            }
        }
    } else {
        for doc in docs {
            for item in resolve_path(doc, path) {
                if !item.is_null() && !collected.contains(item) {
                    collected.push(item.clone());
                }
            }
        }
    }
    collected
}

fn pick_extreme(values: &[&Value], wanted: std::cmp::Ordering) -> Option<Value> {
    let mut best: Option<&Value> = None;
    for value in values {
        match best {
            None => best = Some(value),
            Some(current) => {
                if compare_values(value, current) == Some(wanted) {
                    best = Some(value);
                }
            }
        }
    }
    best.cloned()
}

fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        json!(n as i64)
    } else {
        json!(n)
    }
}
