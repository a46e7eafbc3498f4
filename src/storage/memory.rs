use super::traits::{ChangeQueue, HistoryStore, StorageError, WalEntry, WalStore, WatermarkStore};
use crate::change::Change;
use crate::storage::HistoryEntry;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory implementation of every storage trait. Backs tests and
/// single-process setups where durability is provided elsewhere.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    changes: Mutex<Vec<Change>>,
    watermark: Mutex<Option<DateTime<Utc>>>,
    history: Mutex<Vec<HistoryEntry>>,
    wal: Mutex<Vec<WalEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued_changes(&self) -> Vec<Change> {
        self.changes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChangeQueue for MemoryBackend {
    async fn enqueue(&self, change: &Change) -> Result<bool, StorageError> {
        let mut changes = self.changes.lock().unwrap();
        if changes.iter().any(|c| c.id == change.id) {
            return Ok(false);
        }
        changes.push(change.clone());
        Ok(true)
    }

    async fn claim_next(
        &self,
        max_errors: u32,
        lease_timeout: Option<Duration>,
    ) -> Result<Option<Change>, StorageError> {
        let now = Utc::now();
        let lease = lease_timeout.and_then(|d| ChronoDuration::from_std(d).ok());
        let mut changes = self.changes.lock().unwrap();

        let mut candidate: Option<usize> = None;
        for (index, change) in changes.iter().enumerate() {
            if change.processed_at.is_some() || change.error_count >= max_errors {
                continue;
            }
            let claim_expired = match (change.process_started_at, lease) {
                (Some(started), Some(lease)) => now - started > lease,
                (Some(_), None) => false,
                (None, _) => true,
            };
            if !claim_expired {
                continue;
            }
            match candidate {
                Some(best) if changes[best].ts <= change.ts => {}
                _ => candidate = Some(index),
            }
        }

        Ok(candidate.map(|index| {
            changes[index].process_started_at = Some(now);
            changes[index].clone()
        }))
    }

    async fn mark_processed(&self, id: &str) -> Result<(), StorageError> {
        let mut changes = self.changes.lock().unwrap();
        let change = changes
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StorageError::Generic(format!("change {id} not found")))?;
        change.processed_at = Some(Utc::now());
        change.process_started_at = None;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), StorageError> {
        let mut changes = self.changes.lock().unwrap();
        let change = changes
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StorageError::Generic(format!("change {id} not found")))?;
        change.error_count += 1;
        change.last_error = Some(error.to_string());
        change.process_started_at = None;
        Ok(())
    }

    async fn release(&self, id: &str) -> Result<(), StorageError> {
        let mut changes = self.changes.lock().unwrap();
        let change = changes
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| StorageError::Generic(format!("change {id} not found")))?;
        change.process_started_at = None;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Change>, StorageError> {
        Ok(self.changes.lock().unwrap().iter().find(|c| c.id == id).cloned())
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut changes = self.changes.lock().unwrap();
        let before = changes.len();
        changes.retain(|c| match c.processed_at {
            Some(at) => at >= cutoff,
            None => true,
        });
        Ok((before - changes.len()) as u64)
    }
}

#[async_trait]
impl WatermarkStore for MemoryBackend {
    async fn load(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(*self.watermark.lock().unwrap())
    }

    async fn advance(&self, ts: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut watermark = self.watermark.lock().unwrap();
        match *watermark {
            Some(current) if current >= ts => Ok(false),
            _ => {
                *watermark = Some(ts);
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl HistoryStore for MemoryBackend {
    async fn append(&self, entry: &HistoryEntry) -> Result<(), StorageError> {
        let mut history = self.history.lock().unwrap();
        match history.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry.clone(),
            None => history.push(entry.clone()),
        }
        Ok(())
    }

    async fn last_touching(
        &self,
        document: &str,
        record_id: &str,
        field: &str,
    ) -> Result<Option<HistoryEntry>, StorageError> {
        let history = self.history.lock().unwrap();
        let mut entries: Vec<&HistoryEntry> = history
            .iter()
            .filter(|e| e.document == document && e.record_id == record_id && e.data.contains_key(field))
            .collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries.last().map(|e| (*e).clone()))
    }

    async fn for_record(&self, document: &str, record_id: &str) -> Result<Vec<HistoryEntry>, StorageError> {
        let history = self.history.lock().unwrap();
        let mut entries: Vec<HistoryEntry> = history
            .iter()
            .filter(|e| e.document == document && e.record_id == record_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }
}

#[async_trait]
impl WalStore for MemoryBackend {
    async fn append(&self, entry: &WalEntry) -> Result<bool, StorageError> {
        let mut wal = self.wal.lock().unwrap();
        if wal.iter().any(|e| e.id == entry.id) {
            return Ok(false);
        }
        wal.push(entry.clone());
        Ok(true)
    }

    async fn get(&self, id: &str) -> Result<Option<WalEntry>, StorageError> {
        Ok(self.wal.lock().unwrap().iter().find(|e| e.id == id).cloned())
    }

    async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let mut wal = self.wal.lock().unwrap();
        let before = wal.len();
        wal.retain(|e| e.id != id);
        Ok(wal.len() != before)
    }

    async fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<WalEntry>, StorageError> {
        let wal = self.wal.lock().unwrap();
        Ok(wal.iter().filter(|e| e.ts < cutoff).cloned().collect())
    }
}
