//! Cache layer that orchestrates caching logic with network fetching.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::storage::CacheStorage;
use super::traits::CacheResult;

/// How a single cache-first read should behave.
#[derive(Debug, Clone)]
pub struct FetchOptions {
  pub key: CacheKey,
  pub ttl: Option<Duration>,
  /// Go straight to the network, ignoring any valid cache entry
  pub skip_cache: bool,
}

impl FetchOptions {
  pub fn new(key: CacheKey, ttl: Option<Duration>) -> Self {
    Self {
      key,
      ttl,
      skip_cache: false,
    }
  }

  pub fn skip_cache(mut self, skip: bool) -> Self {
    self.skip_cache = skip;
    self
  }
}

/// Background refresh started after a cache hit.
///
/// The refresh is aborted when this handle is dropped; call [`detach`](Self::detach)
/// to let it finish on its own or [`fresh`](Self::fresh) to wait for the new value.
#[derive(Debug)]
pub struct Revalidation<T> {
  handle: Option<JoinHandle<Option<T>>>,
}

impl<T> Revalidation<T> {
  /// Wait for the refresh; `None` if it failed or was cancelled.
  pub async fn fresh(mut self) -> Option<T> {
    match self.handle.take() {
      Some(handle) => handle.await.ok().flatten(),
      None => None,
    }
  }

  /// Let the refresh run to completion without tracking it.
  pub fn detach(mut self) {
    self.handle.take();
  }
}

impl<T> Drop for Revalidation<T> {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      handle.abort();
    }
  }
}

/// Outcome of a cache-first read.
#[derive(Debug)]
pub struct Fetched<T> {
  pub result: CacheResult<T>,
  /// Present only when the data came from a valid cache entry
  pub revalidation: Option<Revalidation<T>>,
}

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the application and the remote store,
/// providing stale-while-revalidate reads with offline fallback.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Fetch with a cache-first strategy.
  ///
  /// 1. Valid cache entry (and not `skip_cache`): return it and refresh in the background
  /// 2. Otherwise read from the network and store the result under `ttl`
  /// 3. If that read fails, serve any cached value, even expired, as stale
  /// 4. With nothing cached, the network error is returned
  pub async fn fetch_with_cache<T, E, F, Fut>(
    &self,
    options: &FetchOptions,
    fetcher: F,
  ) -> Result<Fetched<T>, E>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    E: Display + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let key = options.key.as_str();

    if !options.skip_cache {
      match self.storage.get_entry::<T>(key) {
        Ok(Some(entry)) if entry.is_valid_at(self.storage.now()) => {
          debug!(key, "cache hit, revalidating in background");
          let revalidation = self.revalidate(options, fetcher());
          return Ok(Fetched {
            result: CacheResult::from_cache(entry.data, entry.stored_at),
            revalidation: Some(revalidation),
          });
        }
        Ok(_) => debug!(key, "cache miss"),
        Err(e) => warn!(key, error = %e, "failed to read cache"),
      }
    }

    match fetcher().await {
      Ok(data) => {
        self.store(key, &data, options.ttl);
        Ok(Fetched {
          result: CacheResult::from_network(data),
          revalidation: None,
        })
      }
      Err(err) => match self.storage.get_entry::<T>(key) {
        Ok(Some(entry)) => {
          warn!(key, error = %err, "remote read failed, using cached data");
          Ok(Fetched {
            result: CacheResult::stale(entry.data, entry.stored_at),
            revalidation: None,
          })
        }
        Ok(None) => Err(err),
        Err(cache_err) => {
          warn!(key, error = %cache_err, "cache fallback failed");
          Err(err)
        }
      },
    }
  }

  fn store<T: Serialize>(&self, key: &str, data: &T, ttl: Option<Duration>) {
    if let Err(e) = self.storage.put(key, data, ttl) {
      warn!(key, error = %e, "failed to write cache");
    }
  }

  fn revalidate<T, E, Fut>(&self, options: &FetchOptions, fut: Fut) -> Revalidation<T>
  where
    T: Serialize + Send + 'static,
    E: Display + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    let key = options.key.to_string();
    let ttl = options.ttl;

    let handle = tokio::spawn(async move {
      match fut.await {
        Ok(data) => {
          if let Err(e) = storage.put(&key, &data, ttl) {
            warn!(key = %key, error = %e, "failed to write refreshed data to cache");
          } else {
            debug!(key = %key, "cache refreshed");
          }
          Some(data)
        }
        Err(e) => {
          warn!(key = %key, error = %e, "failed to refresh from server");
          None
        }
      }
    });

    Revalidation {
      handle: Some(handle),
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}
