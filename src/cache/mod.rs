//! Durable partition store for cached responses.
//!
//! This module provides the storage side of the caching layer:
//! - Named partitions, created lazily on first use and dropped as a whole
//! - Entries keyed by request identity (method + URL), overwritten in place
//! - A body digest per entry so corrupted rows read back as misses
//! - The persisted active version used to resume a running deployment

mod layer;
mod storage;
mod traits;

pub use layer::{Partition, PartitionStore};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheKey, CachedResponse};
