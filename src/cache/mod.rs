//! Partitioned response cache for offline support.
//!
//! This module provides:
//! - Named partitions of (url -> stored response) entries in SQLite
//! - Cache-first, network-first (with timeout) and stale-while-revalidate strategies
//! - Lazy expiration by entry count and age, evaluated at read and write time

mod entry;
mod expiration;
mod layer;
mod storage;
mod traits;

#[cfg(test)]
pub use entry::CacheEntry;
pub use entry::StoredResponse;
pub use expiration::ExpirationPolicy;
pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub(crate) use storage::{format_datetime, parse_datetime};
pub use traits::{CacheResult, CacheSource};
