use super::{record_id, RecordCollection, StoreError, UpdateDoc};
use crate::filter::Filter;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;

/// In-memory record collection. Preserves insertion order so `find` results
/// and first/last aggregates are deterministic in tests.
#[derive(Debug, Default)]
pub struct MemoryCollection {
    docs: Mutex<Vec<Value>>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_docs(docs: Vec<Value>) -> Self {
        Self {
            docs: Mutex::new(docs),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordCollection for MemoryCollection {
    async fn insert(&self, doc: Value) -> Result<(), StoreError> {
        let id = record_id(&doc)
            .ok_or_else(|| StoreError::Backend("record is missing _id".into()))?
            .to_string();
        let mut docs = self.docs.lock().unwrap();
        if docs.iter().any(|d| record_id(d) == Some(id.as_str())) {
            return Err(StoreError::Backend(format!("duplicate _id {id}")));
        }
        docs.push(doc);
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Value>, StoreError> {
        let docs = self.docs.lock().unwrap();
        Ok(docs.iter().find(|d| record_id(d) == Some(id)).cloned())
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let docs = self.docs.lock().unwrap();
        Ok(docs.iter().filter(|d| filter.matches(d)).cloned().collect())
    }

    async fn update_many(&self, filter: &Filter, update: &UpdateDoc) -> Result<u64, StoreError> {
        let mut docs = self.docs.lock().unwrap();
        let mut modified = 0;
        for doc in docs.iter_mut() {
            if filter.matches(doc) && update.apply(doc) {
                modified += 1;
            }
        }
        Ok(modified)
    }

    async fn remove(&self, id: &str) -> Result<Option<Value>, StoreError> {
        let mut docs = self.docs.lock().unwrap();
        match docs.iter().position(|d| record_id(d) == Some(id)) {
            Some(index) => Ok(Some(docs.remove(index))),
            None => Ok(None),
        }
    }
}
