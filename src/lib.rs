//! Client-side synchronization for Trambar data.
//!
//! Queries are deduplicated into Searches, answered from a local cache when
//! the cached rows can be trusted, and invalidated by change notifications
//! pushed from the server.

pub mod cache;
pub mod config;
pub mod criteria;
pub mod data_source;
pub mod event;
pub mod notification;
pub mod remote;
pub mod search;
pub mod types;

pub use cache::{CleanCriteria, LocalCache, MemoryStore, PersistentStore, SqliteStore};
pub use config::Config;
pub use criteria::Criteria;
pub use data_source::{FetchError, NotificationHandle, RemoteDataSource};
pub use event::DataSourceEvent;
pub use remote::{HttpRemote, RemoteSource};
pub use search::Search;
pub use types::{Location, Query, Row, SearchOptions};
