use crate::filter::Filter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Closed set of field types the engine understands. Aggregation and value
/// formatting dispatch on this enum instead of free-form type strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    #[default]
    Text,
    Number,
    Money,
    Boolean,
    Date,
    DateTime,
    Lookup,
    Picklist,
    PersonName,
    Address,
    Phone,
    Email,
    Filter,
}

/// How a field is inherited through a lookup. Only `Always` and
/// `HierarchyAlways` propagate on every change; `Once` is applied at record
/// creation by the write path and never refreshed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritMode {
    Always,
    HierarchyAlways,
    Once,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InheritedField {
    pub field_name: String,
    pub inherit: InheritMode,
}

/// Lookup-specific descriptor carried by fields of type [`FieldType::Lookup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupDef {
    /// Document type the lookup points at.
    pub target_document: String,
    /// Paths copied verbatim from the target record into the frozen snapshot.
    #[serde(default)]
    pub description_fields: Vec<String>,
    #[serde(default)]
    pub inherited_fields: Vec<InheritedField>,
    /// Field on the target document populated with a back-reference.
    #[serde(default)]
    pub reverse_lookup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub is_list: bool,
    #[serde(default)]
    pub ignore_history: bool,
    #[serde(default)]
    pub label: Option<String>,
    /// Present exactly when `field_type` is `Lookup`.
    #[serde(default)]
    pub lookup: Option<LookupDef>,
}

impl FieldDef {
    pub fn text(name: &str) -> Self {
        Self::typed(name, FieldType::Text)
    }

    pub fn typed(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            is_list: false,
            ignore_history: false,
            label: None,
            lookup: None,
        }
    }

    pub fn lookup(name: &str, def: LookupDef) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::Lookup,
            is_list: false,
            ignore_history: false,
            label: None,
            lookup: Some(def),
        }
    }

    pub fn list(mut self) -> Self {
        self.is_list = true;
        self
    }

    pub fn ignore_history(mut self) -> Self {
        self.ignore_history = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregatorOp {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    First,
    Last,
    AddToSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregator {
    #[serde(rename = "aggregator")]
    pub op: AggregatorOp,
    /// Source field on the contributing document; absent for `Count`.
    #[serde(default)]
    pub field: Option<String>,
}

/// A filtered aggregate declared by one document over records of another
/// that point back at it through a lookup field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Contributing document: where the aggregated records live.
    pub document: String,
    /// Lookup field on the contributing document that points at the
    /// declaring document.
    pub lookup: String,
    #[serde(default)]
    pub filter: Option<Filter>,
    /// Output field on the declaring document → how to compute it.
    pub aggregators: BTreeMap<String, Aggregator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub name: String,
    /// Physical collection name in the change feed namespace.
    pub collection: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub save_history: bool,
    #[serde(default)]
    pub send_alerts: bool,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDef>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

impl DocumentMeta {
    pub fn new(name: &str, collection: &str) -> Self {
        Self {
            name: name.to_string(),
            collection: collection.to_string(),
            label: None,
            save_history: false,
            send_alerts: false,
            fields: BTreeMap::new(),
            relations: Vec::new(),
        }
    }

    pub fn save_history(mut self) -> Self {
        self.save_history = true;
        self
    }

    pub fn send_alerts(mut self) -> Self {
        self.send_alerts = true;
        self
    }

    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.insert(def.name.clone(), def);
        self
    }

    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Name of the soft-delete collection paired with this document.
    pub fn trash_collection(&self) -> String {
        format!("{}.Trash", self.collection)
    }

    /// Fields of type lookup, with their descriptors.
    pub fn lookup_fields(&self) -> impl Iterator<Item = (&FieldDef, &LookupDef)> {
        self.fields
            .values()
            .filter_map(|f| f.lookup.as_ref().map(|l| (f, l)))
    }
}
