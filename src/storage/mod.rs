pub mod duckdb;
pub mod memory;
pub mod traits;

pub use self::duckdb::DuckDbBackend;
pub use memory::MemoryBackend;
pub use traits::{
    ChangeQueue, HistoryEntry, HistoryStore, StorageError, WalEntry, WalStore, WatermarkStore,
};
