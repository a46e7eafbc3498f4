use super::types::{DocumentMeta, FieldDef, LookupDef, Relation};
use crate::record::RecordCollection;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A lookup field on some document that points at another document type.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupReference {
    /// Document holding the lookup field.
    pub document: String,
    /// Name of the lookup field.
    pub field: String,
}

/// Explicit, injected metadata registry: document schemas plus the CRUD
/// handles for their collections. Built once at startup and shared through an
/// `Arc`; tests build small isolated registries per case.
#[derive(Default)]
pub struct Registry {
    documents: BTreeMap<String, DocumentMeta>,
    by_collection: BTreeMap<String, String>,
    collections: BTreeMap<String, Arc<dyn RecordCollection>>,
    trash: BTreeMap<String, Arc<dyn RecordCollection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_document(&mut self, meta: DocumentMeta) {
        self.by_collection
            .insert(meta.collection.clone(), meta.name.clone());
        self.documents.insert(meta.name.clone(), meta);
    }

    pub fn bind_collection(&mut self, document: &str, handle: Arc<dyn RecordCollection>) {
        self.collections.insert(document.to_string(), handle);
    }

    pub fn bind_trash(&mut self, document: &str, handle: Arc<dyn RecordCollection>) {
        self.trash.insert(document.to_string(), handle);
    }

    pub fn document(&self, name: &str) -> Option<&DocumentMeta> {
        self.documents.get(name)
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentMeta> {
        self.documents.values()
    }

    /// Reverse-maps a physical collection name (primary or trash) back to its
    /// document metadata.
    pub fn document_by_collection(&self, collection: &str) -> Option<&DocumentMeta> {
        let base = collection.strip_suffix(".Trash").unwrap_or(collection);
        self.by_collection
            .get(base)
            .and_then(|name| self.documents.get(name))
    }

    pub fn collection(&self, document: &str) -> Option<Arc<dyn RecordCollection>> {
        self.collections.get(document).cloned()
    }

    pub fn trash_collection(&self, document: &str) -> Option<Arc<dyn RecordCollection>> {
        self.trash.get(document).cloned()
    }

    /// Every collection namespace the change feed should be filtered to:
    /// each document's primary collection and its trash collection.
    pub fn watched_collections(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.documents.len() * 2);
        for meta in self.documents.values() {
            out.push(meta.collection.clone());
            out.push(meta.trash_collection());
        }
        out
    }

    /// Every (document, lookup field) pair whose lookup points at `document`.
    pub fn references_to(&self, document: &str) -> Vec<LookupReference> {
        let mut out = Vec::new();
        for meta in self.documents.values() {
            for (field, lookup) in meta.lookup_fields() {
                if lookup.target_document == document {
                    out.push(LookupReference {
                        document: meta.name.clone(),
                        field: field.name.clone(),
                    });
                }
            }
        }
        out
    }

    /// Every relation whose contributing document is `document`, paired with
    /// the document that declares it (and receives the aggregate outputs).
    pub fn relations_pointing_at(&self, document: &str) -> Vec<(&DocumentMeta, &Relation)> {
        let mut out = Vec::new();
        for meta in self.documents.values() {
            for relation in &meta.relations {
                if relation.document == document {
                    out.push((meta, relation));
                }
            }
        }
        out
    }

    /// Convenience accessor for a lookup field's descriptor.
    pub fn lookup_field<'a>(&'a self, document: &str, field: &str) -> Option<(&'a FieldDef, &'a LookupDef)> {
        let meta = self.documents.get(document)?;
        let def = meta.fields.get(field)?;
        def.lookup.as_ref().map(|l| (def, l))
    }
}
