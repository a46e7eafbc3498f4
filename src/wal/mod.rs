use crate::change::{Actor, Change, Operation};
use crate::engine::{ChangeOutcome, Engine, PropagationError};
use crate::storage::{StorageError, WalEntry, WalStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("work queue error: {0}")]
    Queue(String),

    #[error("propagation error: {0}")]
    Propagation(#[from] PropagationError),

    #[error("wal entry {0} not found")]
    Missing(String),
}

/// Hand-off to the external worker pool: carries only the WAL entry id, the
/// worker loads the payload back through [`WalStore`].
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn submit(&self, wal_id: &str) -> Result<(), DispatchError>;
}

impl WalEntry {
    /// Reconstructs the canonical change this entry stands for, so remote
    /// processing and in-process processing share one propagation path.
    pub fn to_change(&self) -> Change {
        let changed_fields: Map<String, Value> = match &self.payload {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let actor = self.actor_id.as_ref().map(|id| Actor {
            id: id.clone(),
            name: None,
            group: None,
        });
        Change::new(
            &self.document,
            self.operation,
            &self.record_id,
            changed_fields,
            self.ts,
            actor,
        )
    }
}

/// Write-ahead log for external-worker mode: every mutation is persisted
/// before commit and handed to the work queue after, so a crash between the
/// two leaves a replayable entry instead of silent drift.
pub struct WriteAheadLog {
    store: Arc<dyn WalStore>,
    queue: Arc<dyn WorkQueue>,
}

/// WAL entry id: collision-free per (document, record, millisecond).
pub fn entry_id(document: &str, record_id: &str, ts: DateTime<Utc>) -> String {
    format!("{document}-{record_id}-{}", ts.timestamp_millis())
}

impl WriteAheadLog {
    pub fn new(store: Arc<dyn WalStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }

    /// Persists the intended mutation before the data commit. A storage
    /// failure here must abort the caller's write, hence the hard error.
    pub async fn write_ahead(
        &self,
        document: &str,
        record_id: &str,
        operation: Operation,
        payload: Value,
        actor_id: Option<String>,
        ts: DateTime<Utc>,
    ) -> Result<WalEntry, DispatchError> {
        let entry = WalEntry {
            id: entry_id(document, record_id, ts),
            document: document.to_string(),
            record_id: record_id.to_string(),
            operation,
            payload,
            actor_id,
            ts,
        };
        let inserted = self.store.append(&entry).await?;
        if !inserted {
            debug!(wal_id = %entry.id, "wal entry already present, reusing");
        }
        Ok(entry)
    }

    /// Notifies the worker pool after the data commit. Failure leaves the
    /// entry in place for [`WriteAheadLog::resubmit_stale`] to pick up.
    pub async fn dispatch(&self, wal_id: &str) -> Result<(), DispatchError> {
        match self.queue.submit(wal_id).await {
            Ok(()) => {
                debug!(wal_id = %wal_id, "dispatched wal entry");
                Ok(())
            }
            Err(e) => {
                warn!(wal_id = %wal_id, error = %e, "dispatch failed, entry kept for resubmission");
                Err(e)
            }
        }
    }

    /// Worker-side entry point: loads the entry, runs the full propagation,
    /// and deletes the entry only after success.
    pub async fn process_remote(
        &self,
        engine: &Engine,
        wal_id: &str,
    ) -> Result<ChangeOutcome, DispatchError> {
        let entry = self
            .store
            .get(wal_id)
            .await?
            .ok_or_else(|| DispatchError::Missing(wal_id.to_string()))?;

        let outcome = engine.apply_change(&entry.to_change()).await?;
        self.store.remove(wal_id).await?;
        Ok(outcome)
    }

    /// Re-dispatches entries older than the health-check window. An entry
    /// that old means its ack never arrived: worker crash or lost dispatch.
    pub async fn resubmit_stale(&self, window: Duration) -> Result<u64, DispatchError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        let stale = self.store.older_than(cutoff).await?;
        let mut resubmitted = 0;
        for entry in &stale {
            match self.queue.submit(&entry.id).await {
                Ok(()) => resubmitted += 1,
                Err(e) => warn!(wal_id = %entry.id, error = %e, "stale resubmission failed"),
            }
        }
        if resubmitted > 0 {
            info!(resubmitted, "resubmitted stale wal entries");
        }
        Ok(resubmitted)
    }
}
