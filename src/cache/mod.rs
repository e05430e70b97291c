//! Local cache of previously retrieved rows.
//!
//! This module provides the storage half of the sync layer:
//! - Rows are kept per `(server, schema, table)`, sorted by key
//! - Lookups by key use binary search; other criteria scan the table
//! - Rows in the `local` schema are persisted as one JSON blob per database
//! - Remote rows can be evicted by server, by count or by age

pub mod local;
pub mod row;
pub mod storage;

pub use local::{CleanCriteria, LocalCache};
pub use storage::{MemoryStore, PersistentStore, SqliteStore};
