//! Konsistent keeps denormalized copies of document data consistent across a
//! metadata-driven collection set.
//!
//! Mutations on watched collections are captured as [`change::Change`]s into a
//! durable queue, then a single-flight processor propagates each change:
//! lookup snapshots on referencing records, reverse lookup lists on targets,
//! relation aggregates on related records, and a history trail. An optional
//! write-ahead log hands propagation to external workers instead.

pub mod alerts;
pub mod change;
pub mod config;
pub mod engine;
pub mod filter;
pub mod metadata;
pub mod queue;
pub mod record;
pub mod storage;
pub mod wal;

pub use change::{Actor, Change, Operation};
pub use config::Config;
pub use engine::Engine;
pub use filter::Filter;
pub use metadata::Registry;
pub use storage::{DuckDbBackend, MemoryBackend};
