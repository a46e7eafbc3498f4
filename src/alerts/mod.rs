pub mod format;

pub use format::format_value;

use crate::change::{Actor, Change, Operation, VOLATILE_FIELDS};
use crate::metadata::Registry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

/// One changed field, formatted for humans.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertField {
    pub name: String,
    pub label: String,
    pub formatted: String,
}

/// Human-readable summary of a processed change on an alert-enabled document.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeAlert {
    pub document: String,
    pub label: String,
    pub operation: Operation,
    pub record_id: String,
    pub actor: Option<Actor>,
    pub ts: DateTime<Utc>,
    pub fields: Vec<AlertField>,
}

/// Delivery seam for alerts. Implementors own the transport (mail, webhook,
/// message bus); the engine only builds and hands over the alert.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &ChangeAlert) -> Result<(), AlertError>;
}

/// Builds the alert for a change, or `None` when the document does not have
/// alerts enabled or nothing presentable changed.
pub fn build_alert(registry: &Registry, change: &Change) -> Option<ChangeAlert> {
    let meta = registry.document(&change.document)?;
    if !meta.send_alerts {
        return None;
    }

    let mut fields = Vec::new();
    for (name, value) in &change.changed_fields {
        if VOLATILE_FIELDS.contains(&name.as_str()) {
            continue;
        }
        let def = meta.fields.get(name);
        if def.is_some_and(|d| d.ignore_history) {
            continue;
        }
        let label = def
            .and_then(|d| d.label.clone())
            .unwrap_or_else(|| name.clone());
        let formatted = match def {
            Some(def) => format_value(registry, def, value),
            None => format::display_scalar(value),
        };
        fields.push(AlertField {
            name: name.clone(),
            label,
            formatted,
        });
    }

    if fields.is_empty() {
        return None;
    }

    Some(ChangeAlert {
        document: meta.name.clone(),
        label: meta.label.clone().unwrap_or_else(|| meta.name.clone()),
        operation: change.operation,
        record_id: change.record_id.clone(),
        actor: change.actor.clone(),
        ts: change.ts,
        fields,
    })
}
