use super::traits::{ChangeQueue, HistoryStore, StorageError, WalEntry, WalStore, WatermarkStore};
use crate::change::{Change, Operation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{Connection, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// DuckDB-backed implementation of the storage traits. One embedded database
/// file holds the change queue, the watermark, history, and the WAL, so a
/// single fsync domain covers all engine state.
pub struct DuckDbBackend {
    conn: Arc<Mutex<Connection>>,
}

fn invalid_ts(column: usize) -> duckdb::Error {
    duckdb::Error::FromSqlConversionFailure(
        column,
        duckdb::types::Type::BigInt,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "invalid timestamp",
        )),
    )
}

fn json_failure(column: usize, e: serde_json::Error) -> duckdb::Error {
    duckdb::Error::FromSqlConversionFailure(column, duckdb::types::Type::Text, Box::new(e))
}

fn ts_from_micros(column: usize, micros: i64) -> Result<DateTime<Utc>, duckdb::Error> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| invalid_ts(column))
}

const CHANGE_COLUMNS: &str = "id, document, operation, record_id, changed_fields, epoch_us(ts), \
     actor, epoch_us(process_started_at), epoch_us(processed_at), error_count, last_error";

fn change_from_row(row: &Row<'_>) -> Result<Change, duckdb::Error> {
    let operation: String = row.get(2)?;
    let changed_fields: String = row.get(4)?;
    let actor: Option<String> = row.get(6)?;
    Ok(Change {
        id: row.get(0)?,
        document: row.get(1)?,
        operation: Operation::from_str(&operation).map_err(|e| {
            duckdb::Error::FromSqlConversionFailure(
                2,
                duckdb::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?,
        record_id: row.get(3)?,
        changed_fields: serde_json::from_str(&changed_fields).map_err(|e| json_failure(4, e))?,
        ts: ts_from_micros(5, row.get::<_, i64>(5)?)?,
        actor: actor
            .map(|a| serde_json::from_str(&a).map_err(|e| json_failure(6, e)))
            .transpose()?,
        process_started_at: row
            .get::<_, Option<i64>>(7)?
            .map(|m| ts_from_micros(7, m))
            .transpose()?,
        processed_at: row
            .get::<_, Option<i64>>(8)?
            .map(|m| ts_from_micros(8, m))
            .transpose()?,
        error_count: row.get(9)?,
        last_error: row.get(10)?,
    })
}

impl DuckDbBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            conn.execute(
                "CREATE TABLE IF NOT EXISTS changes (
                    id VARCHAR PRIMARY KEY,
                    document VARCHAR NOT NULL,
                    operation VARCHAR NOT NULL,
                    record_id VARCHAR NOT NULL,
                    changed_fields JSON NOT NULL,
                    ts TIMESTAMPTZ NOT NULL,
                    actor JSON,
                    process_started_at TIMESTAMPTZ,
                    processed_at TIMESTAMPTZ,
                    error_count UINTEGER NOT NULL DEFAULT 0,
                    last_error VARCHAR
                )",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_changes_ts ON changes(ts)",
                [],
            )?;

            // Singleton row, same shape as a checkpoint table.
            conn.execute(
                "CREATE TABLE IF NOT EXISTS watermark (
                    id INTEGER PRIMARY KEY DEFAULT 1,
                    ts TIMESTAMPTZ NOT NULL,
                    CHECK (id = 1)
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS history (
                    id VARCHAR PRIMARY KEY,
                    document VARCHAR NOT NULL,
                    record_id VARCHAR NOT NULL,
                    kind VARCHAR NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    created_by JSON NOT NULL,
                    data JSON NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_history_record ON history(document, record_id)",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS wal (
                    id VARCHAR PRIMARY KEY,
                    document VARCHAR NOT NULL,
                    record_id VARCHAR NOT NULL,
                    operation VARCHAR NOT NULL,
                    payload JSON NOT NULL,
                    actor_id VARCHAR,
                    ts TIMESTAMPTZ NOT NULL
                )",
                [],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }
}

#[async_trait]
impl ChangeQueue for DuckDbBackend {
    async fn enqueue(&self, change: &Change) -> Result<bool, StorageError> {
        let conn = self.conn.clone();
        let change = change.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let changed_fields = serde_json::to_string(&change.changed_fields)?;
            let actor = change
                .actor
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let inserted = conn.execute(
                "INSERT OR IGNORE INTO changes
                     (id, document, operation, record_id, changed_fields, ts, actor, error_count)
                 VALUES (?, ?, ?, ?, ?, to_timestamp(? / 1000000.0), ?, 0)",
                duckdb::params![
                    change.id,
                    change.document,
                    change.operation.as_str(),
                    change.record_id,
                    changed_fields,
                    change.ts.timestamp_micros(),
                    actor,
                ],
            )?;

            Ok::<bool, StorageError>(inserted > 0)
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }

    async fn claim_next(
        &self,
        max_errors: u32,
        lease_timeout: Option<Duration>,
    ) -> Result<Option<Change>, StorageError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            // Select-then-stamp is atomic because the connection mutex is held
            // for the whole closure.
            let conn = conn.lock().unwrap();
            let now = Utc::now();

            let candidate = match lease_timeout {
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {CHANGE_COLUMNS} FROM changes
                         WHERE processed_at IS NULL
                           AND process_started_at IS NULL
                           AND error_count < ?
                         ORDER BY ts
                         LIMIT 1"
                    ))?;
                    let mut rows = stmt.query(duckdb::params![max_errors])?;
                    match rows.next()? {
                        Some(row) => Some(change_from_row(row)?),
                        None => None,
                    }
                }
                Some(lease) => {
                    let cutoff = now - chrono::Duration::from_std(lease).unwrap_or_default();
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {CHANGE_COLUMNS} FROM changes
                         WHERE processed_at IS NULL
                           AND (process_started_at IS NULL
                                OR process_started_at < to_timestamp(? / 1000000.0))
                           AND error_count < ?
                         ORDER BY ts
                         LIMIT 1"
                    ))?;
                    let mut rows =
                        stmt.query(duckdb::params![cutoff.timestamp_micros(), max_errors])?;
                    match rows.next()? {
                        Some(row) => Some(change_from_row(row)?),
                        None => None,
                    }
                }
            };

            let Some(mut change) = candidate else {
                return Ok(None);
            };

            conn.execute(
                "UPDATE changes SET process_started_at = to_timestamp(? / 1000000.0) WHERE id = ?",
                duckdb::params![now.timestamp_micros(), change.id],
            )?;
            change.process_started_at = Some(now);

            Ok::<Option<Change>, StorageError>(Some(change))
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }

    async fn mark_processed(&self, id: &str) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let id = id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let updated = conn.execute(
                "UPDATE changes
                 SET processed_at = to_timestamp(? / 1000000.0), process_started_at = NULL
                 WHERE id = ?",
                duckdb::params![Utc::now().timestamp_micros(), id],
            )?;
            if updated == 0 {
                return Err(StorageError::Generic(format!("change {id} not found")));
            }
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        let error = error.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let updated = conn.execute(
                "UPDATE changes
                 SET error_count = error_count + 1, last_error = ?, process_started_at = NULL
                 WHERE id = ?",
                duckdb::params![error, id],
            )?;
            if updated == 0 {
                return Err(StorageError::Generic(format!("change {id} not found")));
            }
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }

    async fn release(&self, id: &str) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let id = id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let updated = conn.execute(
                "UPDATE changes SET process_started_at = NULL WHERE id = ?",
                duckdb::params![id],
            )?;
            if updated == 0 {
                return Err(StorageError::Generic(format!("change {id} not found")));
            }
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }

    async fn get(&self, id: &str) -> Result<Option<Change>, StorageError> {
        let conn = self.conn.clone();
        let id = id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt =
                conn.prepare(&format!("SELECT {CHANGE_COLUMNS} FROM changes WHERE id = ?"))?;
            let mut rows = stmt.query(duckdb::params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(change_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let conn = self.conn.clone();
        let cutoff_micros = cutoff.timestamp_micros();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let deleted = conn.execute(
                "DELETE FROM changes
                 WHERE processed_at IS NOT NULL
                   AND processed_at < to_timestamp(? / 1000000.0)",
                duckdb::params![cutoff_micros],
            )?;
            Ok::<u64, StorageError>(deleted as u64)
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }
}

#[async_trait]
impl WatermarkStore for DuckDbBackend {
    async fn load(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT epoch_us(ts) FROM watermark WHERE id = 1")?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Ok(Some(ts_from_micros(0, row.get::<_, i64>(0)?)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }

    async fn advance(&self, ts: DateTime<Utc>) -> Result<bool, StorageError> {
        let conn = self.conn.clone();
        let ts_micros = ts.timestamp_micros();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            let current: Option<i64> = {
                let mut stmt = conn.prepare("SELECT epoch_us(ts) FROM watermark WHERE id = 1")?;
                let mut rows = stmt.query([])?;
                match rows.next()? {
                    Some(row) => Some(row.get(0)?),
                    None => None,
                }
            };

            if let Some(current) = current {
                if current >= ts_micros {
                    return Ok(false);
                }
            }

            conn.execute(
                "INSERT OR REPLACE INTO watermark (id, ts) VALUES (1, to_timestamp(? / 1000000.0))",
                duckdb::params![ts_micros],
            )?;

            Ok::<bool, StorageError>(true)
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }
}

#[async_trait]
impl HistoryStore for DuckDbBackend {
    async fn append(&self, entry: &super::HistoryEntry) -> Result<(), StorageError> {
        let conn = self.conn.clone();
        let entry = entry.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let created_by = serde_json::to_string(&entry.created_by)?;
            let data = serde_json::to_string(&entry.data)?;

            conn.execute(
                "INSERT OR REPLACE INTO history
                     (id, document, record_id, kind, created_at, created_by, data)
                 VALUES (?, ?, ?, ?, to_timestamp(? / 1000000.0), ?, ?)",
                duckdb::params![
                    entry.id,
                    entry.document,
                    entry.record_id,
                    entry.kind.as_str(),
                    entry.created_at.timestamp_micros(),
                    created_by,
                    data,
                ],
            )?;

            Ok::<(), StorageError>(())
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }

    async fn last_touching(
        &self,
        document: &str,
        record_id: &str,
        field: &str,
    ) -> Result<Option<super::HistoryEntry>, StorageError> {
        let entries = self.for_record(document, record_id).await?;
        Ok(entries
            .into_iter()
            .rev()
            .find(|e| e.data.contains_key(field)))
    }

    async fn for_record(
        &self,
        document: &str,
        record_id: &str,
    ) -> Result<Vec<super::HistoryEntry>, StorageError> {
        let conn = self.conn.clone();
        let document = document.to_string();
        let record_id = record_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, document, record_id, kind, epoch_us(created_at), created_by, data
                 FROM history
                 WHERE document = ? AND record_id = ?
                 ORDER BY created_at",
            )?;

            let rows = stmt.query_map(duckdb::params![document, record_id], |row| {
                let kind: String = row.get(3)?;
                let created_by: String = row.get(5)?;
                let data: String = row.get(6)?;
                Ok(super::HistoryEntry {
                    id: row.get(0)?,
                    document: row.get(1)?,
                    record_id: row.get(2)?,
                    kind: Operation::from_str(&kind).map_err(|e| {
                        duckdb::Error::FromSqlConversionFailure(
                            3,
                            duckdb::types::Type::Text,
                            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
                        )
                    })?,
                    created_at: ts_from_micros(4, row.get::<_, i64>(4)?)?,
                    created_by: serde_json::from_str(&created_by)
                        .map_err(|e| json_failure(5, e))?,
                    data: serde_json::from_str(&data).map_err(|e| json_failure(6, e))?,
                })
            })?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }
}

#[async_trait]
impl WalStore for DuckDbBackend {
    async fn append(&self, entry: &WalEntry) -> Result<bool, StorageError> {
        let conn = self.conn.clone();
        let entry = entry.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let payload = serde_json::to_string(&entry.payload)?;

            let inserted = conn.execute(
                "INSERT OR IGNORE INTO wal (id, document, record_id, operation, payload, actor_id, ts)
                 VALUES (?, ?, ?, ?, ?, ?, to_timestamp(? / 1000000.0))",
                duckdb::params![
                    entry.id,
                    entry.document,
                    entry.record_id,
                    entry.operation.as_str(),
                    payload,
                    entry.actor_id,
                    entry.ts.timestamp_micros(),
                ],
            )?;

            Ok::<bool, StorageError>(inserted > 0)
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }

    async fn get(&self, id: &str) -> Result<Option<WalEntry>, StorageError> {
        let conn = self.conn.clone();
        let id = id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, document, record_id, operation, payload, actor_id, epoch_us(ts)
                 FROM wal WHERE id = ?",
            )?;
            let mut rows = stmt.query(duckdb::params![id])?;

            match rows.next()? {
                Some(row) => Ok(Some(wal_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }

    async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let conn = self.conn.clone();
        let id = id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let deleted = conn.execute("DELETE FROM wal WHERE id = ?", duckdb::params![id])?;
            Ok::<bool, StorageError>(deleted > 0)
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }

    async fn older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<WalEntry>, StorageError> {
        let conn = self.conn.clone();
        let cutoff_micros = cutoff.timestamp_micros();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, document, record_id, operation, payload, actor_id, epoch_us(ts)
                 FROM wal
                 WHERE ts < to_timestamp(? / 1000000.0)
                 ORDER BY ts",
            )?;

            let rows = stmt.query_map(duckdb::params![cutoff_micros], wal_from_row)?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
        .await
        .map_err(|e| StorageError::Generic(format!("task join error: {e}")))?
    }
}

fn wal_from_row(row: &Row<'_>) -> Result<WalEntry, duckdb::Error> {
    let operation: String = row.get(3)?;
    let payload: String = row.get(4)?;
    Ok(WalEntry {
        id: row.get(0)?,
        document: row.get(1)?,
        record_id: row.get(2)?,
        operation: Operation::from_str(&operation).map_err(|e| {
            duckdb::Error::FromSqlConversionFailure(
                3,
                duckdb::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?,
        payload: serde_json::from_str(&payload).map_err(|e| json_failure(4, e))?,
        actor_id: row.get(5)?,
        ts: ts_from_micros(6, row.get::<_, i64>(6)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::HistoryEntry;
    use serde_json::{json, Map};

    async fn setup_backend() -> DuckDbBackend {
        let backend = DuckDbBackend::in_memory().unwrap();
        backend.init_schema().await.unwrap();
        backend
    }

    fn change(record_id: &str, ts: DateTime<Utc>) -> Change {
        let mut fields = Map::new();
        fields.insert("name".to_string(), json!("Alice"));
        Change::new("Contact", Operation::Update, record_id, fields, ts, None)
    }

    #[tokio::test]
    async fn test_schema_initialization() {
        let backend = DuckDbBackend::in_memory().unwrap();
        assert!(backend.init_schema().await.is_ok());
    }

    #[tokio::test]
    async fn test_enqueue_round_trip_and_dedup() {
        let backend = setup_backend().await;
        let c = change("c1", Utc::now());

        assert!(backend.enqueue(&c).await.unwrap());
        assert!(!backend.enqueue(&c).await.unwrap());

        let stored = ChangeQueue::get(&backend, &c.id).await.unwrap().unwrap();
        assert_eq!(stored.document, "Contact");
        assert_eq!(stored.record_id, "c1");
        assert_eq!(stored.changed_fields["name"], json!("Alice"));
        assert_eq!(stored.error_count, 0);
        assert!(stored.process_started_at.is_none());
    }

    #[tokio::test]
    async fn test_claim_orders_by_source_timestamp() {
        let backend = setup_backend().await;
        let now = Utc::now();
        let newer = change("b", now);
        let older = change("a", now - chrono::Duration::seconds(30));
        backend.enqueue(&newer).await.unwrap();
        backend.enqueue(&older).await.unwrap();

        let first = backend.claim_next(3, None).await.unwrap().unwrap();
        assert_eq!(first.record_id, "a");
        let second = backend.claim_next(3, None).await.unwrap().unwrap();
        assert_eq!(second.record_id, "b");
        assert!(backend.claim_next(3, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_failed_then_retry_ceiling() {
        let backend = setup_backend().await;
        let c = change("c1", Utc::now());
        backend.enqueue(&c).await.unwrap();

        for _ in 0..3 {
            let claimed = backend.claim_next(3, None).await.unwrap().unwrap();
            backend.mark_failed(&claimed.id, "write failed").await.unwrap();
        }

        let stored = ChangeQueue::get(&backend, &c.id).await.unwrap().unwrap();
        assert_eq!(stored.error_count, 3);
        assert_eq!(stored.last_error.as_deref(), Some("write failed"));
        assert!(backend.claim_next(3, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_clears_claim_without_an_attempt() {
        let backend = setup_backend().await;
        let c = change("c1", Utc::now());
        backend.enqueue(&c).await.unwrap();

        let claimed = backend.claim_next(3, None).await.unwrap().unwrap();
        assert!(backend.claim_next(3, None).await.unwrap().is_none());

        backend.release(&claimed.id).await.unwrap();
        let stored = ChangeQueue::get(&backend, &c.id).await.unwrap().unwrap();
        assert_eq!(stored.error_count, 0);
        assert!(stored.process_started_at.is_none());
        assert!(backend.claim_next(3, None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_removes_only_old_processed() {
        let backend = setup_backend().await;
        let done = change("done", Utc::now() - chrono::Duration::hours(2));
        let pending = change("pending", Utc::now());
        backend.enqueue(&done).await.unwrap();
        backend.enqueue(&pending).await.unwrap();
        backend.mark_processed(&done.id).await.unwrap();

        // Everything processed so far is older than a future cutoff.
        let purged = backend
            .purge_processed_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(ChangeQueue::get(&backend, &done.id).await.unwrap().is_none());
        assert!(ChangeQueue::get(&backend, &pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_watermark_round_trip_and_monotonicity() {
        let backend = setup_backend().await;
        assert!(backend.load().await.unwrap().is_none());

        let t1 = Utc::now();
        assert!(backend.advance(t1).await.unwrap());
        assert!(!backend.advance(t1 - chrono::Duration::seconds(10)).await.unwrap());

        let loaded = backend.load().await.unwrap().unwrap();
        assert_eq!(loaded.timestamp_micros(), t1.timestamp_micros());
    }

    #[tokio::test]
    async fn test_history_upsert_and_last_touching() {
        let backend = setup_backend().await;
        let base = Utc::now();

        let mut first_data = Map::new();
        first_data.insert("status".to_string(), json!("open"));
        let first = HistoryEntry {
            id: "h1".to_string(),
            document: "Opportunity".to_string(),
            record_id: "o1".to_string(),
            kind: Operation::Create,
            created_at: base,
            created_by: json!({"_id": "u1"}),
            data: first_data,
        };

        let mut second_data = Map::new();
        second_data.insert("status".to_string(), json!("won"));
        second_data.insert("value".to_string(), json!(100));
        let second = HistoryEntry {
            id: "h2".to_string(),
            document: "Opportunity".to_string(),
            record_id: "o1".to_string(),
            kind: Operation::Update,
            created_at: base + chrono::Duration::seconds(5),
            created_by: json!({"_id": "u1"}),
            data: second_data,
        };

        HistoryStore::append(&backend, &first).await.unwrap();
        HistoryStore::append(&backend, &second).await.unwrap();
        // Replayed append with the same id replaces, never duplicates.
        HistoryStore::append(&backend, &second).await.unwrap();

        let entries = backend.for_record("Opportunity", "o1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "h1");

        let last = backend
            .last_touching("Opportunity", "o1", "status")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.id, "h2");
        assert!(backend
            .last_touching("Opportunity", "o1", "owner")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_wal_round_trip() {
        let backend = setup_backend().await;
        let entry = WalEntry {
            id: "Contact-c1-1000".to_string(),
            document: "Contact".to_string(),
            record_id: "c1".to_string(),
            operation: Operation::Update,
            payload: json!({"name": "Alice"}),
            actor_id: Some("u1".to_string()),
            ts: Utc::now(),
        };

        assert!(WalStore::append(&backend, &entry).await.unwrap());
        assert!(!WalStore::append(&backend, &entry).await.unwrap());

        let stored = WalStore::get(&backend, &entry.id).await.unwrap().unwrap();
        assert_eq!(stored.payload["name"], json!("Alice"));
        assert_eq!(stored.actor_id.as_deref(), Some("u1"));

        let stale = backend
            .older_than(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);

        assert!(backend.remove(&entry.id).await.unwrap());
        assert!(!backend.remove(&entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("konsistent.duckdb");

        {
            let backend = DuckDbBackend::new(&path).unwrap();
            backend.init_schema().await.unwrap();
            backend.enqueue(&change("c1", Utc::now())).await.unwrap();
        }

        let backend = DuckDbBackend::new(&path).unwrap();
        backend.init_schema().await.unwrap();
        let claimed = backend.claim_next(3, None).await.unwrap();
        assert!(claimed.is_some());
    }
}
