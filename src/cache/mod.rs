//! Persistent local cache and the cache-first read path.
//!
//! This module provides:
//! - A durable key/value store with per-entry TTL that survives restarts
//! - Expired entries read as absent and are purged lazily, never proactively
//! - Stale-while-revalidate fetching with a cancellable background refresh
//! - Offline fallback to any cached value (even expired) when the network fails

mod key;
mod layer;
mod storage;
mod traits;

pub use key::CacheKey;
pub use layer::{CacheLayer, FetchOptions, Fetched, Revalidation};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheEntry, CacheResult, CacheSource, Clock, SystemClock};
