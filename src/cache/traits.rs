//! Core types for the caching system.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// A stored value together with its storage metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub key: String,
  pub data: T,
  pub stored_at: DateTime<Utc>,
  /// No ttl means the entry never expires
  pub ttl: Option<Duration>,
}

impl<T> CacheEntry<T> {
  /// Valid iff `now - stored_at <= ttl`.
  pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
    match self.ttl {
      None => true,
      Some(ttl) => {
        let age = now.signed_duration_since(self.stored_at);
        match chrono::Duration::from_std(ttl) {
          Ok(ttl) => age <= ttl,
          // ttl too large to represent: effectively never expires
          Err(_) => true,
        }
      }
    }
  }
}

/// Source of time for expiry decisions.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a valid cache entry.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a result for a failed remote read served from whatever was cached.
  pub fn stale(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Stale,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_stale(&self) -> bool {
    self.source == CacheSource::Stale
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Valid cache entry; a background refresh was started
  Cache,
  /// Network read failed, serving a cached (possibly expired) value
  Stale,
}
