use crate::change::{Change, Operation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Generic(String),
}

/// One immutable audit entry per mutation on a history-enabled document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Equals the originating change id; appends are upserts so replays
    /// cannot duplicate history.
    pub id: String,
    pub document: String,
    pub record_id: String,
    pub kind: Operation,
    pub created_at: DateTime<Utc>,
    pub created_by: Value,
    /// Post-filter changed-field diff.
    pub data: Map<String, Value>,
}

/// Pre-commit record of an intended mutation, external-worker mode only.
/// An entry that survives a crash means propagation never completed and the
/// entry must be resubmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// `{document}-{record_id}-{ts_millis}`.
    pub id: String,
    pub document: String,
    pub record_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub actor_id: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Durable, deduplicated queue of canonical changes.
#[async_trait]
pub trait ChangeQueue: Send + Sync {
    /// Inserts the change; returns `false` when a change with the same id is
    /// already queued (at-least-once dedup).
    async fn enqueue(&self, change: &Change) -> Result<bool, StorageError>;

    /// Atomically claims the oldest unclaimed change that has neither been
    /// processed nor exhausted its retries, stamping `process_started_at`.
    /// With a `lease_timeout`, claims older than the lease are reclaimable;
    /// without one, a crashed worker's claim sticks until operator action.
    async fn claim_next(
        &self,
        max_errors: u32,
        lease_timeout: Option<Duration>,
    ) -> Result<Option<Change>, StorageError>;

    /// Marks the change successfully processed (sets `processed_at` once).
    async fn mark_processed(&self, id: &str) -> Result<(), StorageError>;

    /// Records a failed attempt: bumps `error_count`, stores the error, and
    /// clears the claim so the change becomes reclaimable.
    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), StorageError>;

    /// Clears a claim without recording an attempt, returning the change to
    /// the queue unchanged.
    async fn release(&self, id: &str) -> Result<(), StorageError>;

    async fn get(&self, id: &str) -> Result<Option<Change>, StorageError>;

    /// Drops processed changes older than the retention cutoff.
    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;
}

/// Singleton watermark: the source timestamp up to which all changes have
/// been durably applied.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Advances the watermark, never backwards. Returns whether it moved.
    async fn advance(&self, ts: DateTime<Utc>) -> Result<bool, StorageError>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Upserts by entry id.
    async fn append(&self, entry: &HistoryEntry) -> Result<(), StorageError>;

    /// Most recent entry for the record whose diff touches `field`. Drives
    /// old-target resolution when a relation's lookup field changes.
    async fn last_touching(
        &self,
        document: &str,
        record_id: &str,
        field: &str,
    ) -> Result<Option<HistoryEntry>, StorageError>;

    /// All entries for a record, oldest first.
    async fn for_record(&self, document: &str, record_id: &str) -> Result<Vec<HistoryEntry>, StorageError>;
}

#[async_trait]
pub trait WalStore: Send + Sync {
    /// Returns `false` when an entry with the same id already exists.
    async fn append(&self, entry: &WalEntry) -> Result<bool, StorageError>;

    async fn get(&self, id: &str) -> Result<Option<WalEntry>, StorageError>;

    /// Deletes an acknowledged entry; returns whether it existed.
    async fn remove(&self, id: &str) -> Result<bool, StorageError>;

    /// Entries written before the cutoff: candidates for resubmission.
    async fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<WalEntry>, StorageError>;
}
