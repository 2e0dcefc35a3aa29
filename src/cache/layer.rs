//! Cache layer that orchestrates the three caching strategies with network fetching.

use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::entry::{CacheEntry, StoredResponse};
use super::expiration::ExpirationPolicy;
use super::storage::CacheStorage;
use super::traits::CacheResult;
use crate::config::StrategyKind;
use crate::error::{WorkerError, WorkerResult};

/// Cache layer that manages caching logic and network fetching.
///
/// Fetchers are passed in as closures so the layer stays independent of the HTTP
/// client. Expiration is evaluated lazily: on every lookup and after every write.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  policies: Arc<BTreeMap<String, ExpirationPolicy>>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: Arc<S>, policies: BTreeMap<String, ExpirationPolicy>) -> Self {
    Self {
      storage,
      policies: Arc::new(policies),
    }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Look up a live entry, evicting whatever the partition policy no longer allows.
  pub fn lookup(&self, partition: &str, key: &str) -> WorkerResult<Option<CacheEntry>> {
    if let Some(policy) = self.policies.get(partition) {
      policy.enforce(self.storage.as_ref(), partition, Utc::now())?;
    }
    Ok(self.storage.get(partition, key)?)
  }

  /// Lookup for the request path: a broken store counts as a miss.
  fn lookup_or_miss(&self, partition: &str, key: &str) -> Option<CacheEntry> {
    self.lookup(partition, key).unwrap_or_else(|e| {
      warn!(partition, key, error = %e, "cache lookup failed, treating as miss");
      None
    })
  }

  fn try_store(
    &self,
    partition: &str,
    key: &str,
    strategy: StrategyKind,
    response: &StoredResponse,
  ) -> WorkerResult<()> {
    if !response.is_success() {
      return Ok(());
    }
    let entry = CacheEntry::new(partition, key, strategy, response.clone());
    self.storage.put(&entry)?;
    if let Some(policy) = self.policies.get(partition) {
      policy.enforce(self.storage.as_ref(), partition, Utc::now())?;
    }
    Ok(())
  }

  /// Cache a fetched response. A failed write leaves the response uncached.
  fn store(&self, partition: &str, key: &str, strategy: StrategyKind, response: &StoredResponse) {
    if let Err(e) = self.try_store(partition, key, strategy, response) {
      warn!(partition, key, error = %e, "failed to cache response");
    }
  }

  /// Serve from cache when present, otherwise fetch, store and return.
  ///
  /// A network failure with no cache entry propagates to the caller.
  pub async fn cache_first<F, Fut>(
    &self,
    partition: &str,
    key: &str,
    fetcher: F,
  ) -> WorkerResult<CacheResult<StoredResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = WorkerResult<StoredResponse>>,
  {
    if let Some(cached) = self.lookup_or_miss(partition, key) {
      debug!(partition, key, "cache-first hit");
      return Ok(CacheResult::from_cache(
        cached.response,
        cached.cached_at,
        false,
      ));
    }

    let response = fetcher().await?;
    self.store(partition, key, StrategyKind::CacheFirst, &response);
    Ok(CacheResult::from_network(response))
  }

  /// Race the network against `timeout`; fall back to cache on error or timeout.
  ///
  /// The losing side of the race is dropped, which cancels the in-flight fetch.
  pub async fn network_first<F, Fut>(
    &self,
    partition: &str,
    key: &str,
    timeout: Duration,
    fetcher: F,
  ) -> WorkerResult<CacheResult<StoredResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = WorkerResult<StoredResponse>>,
  {
    let failure = match tokio::time::timeout(timeout, fetcher()).await {
      Ok(Ok(response)) => {
        self.store(partition, key, StrategyKind::NetworkFirst, &response);
        return Ok(CacheResult::from_network(response));
      }
      Ok(Err(e)) => e,
      Err(_) => WorkerError::Timeout {
        url: key.to_string(),
        timeout,
      },
    };

    match self.lookup_or_miss(partition, key) {
      Some(cached) => {
        debug!(partition, key, error = %failure, "network-first falling back to cache");
        Ok(CacheResult::offline(cached.response, cached.cached_at))
      }
      None => Err(failure),
    }
  }

  /// Serve the cached entry immediately (or wait for the network when there is none)
  /// and always refresh the entry in the background.
  pub async fn stale_while_revalidate<F, Fut>(
    &self,
    partition: &str,
    key: &str,
    fetcher: F,
  ) -> WorkerResult<CacheResult<StoredResponse>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = WorkerResult<StoredResponse>> + Send + 'static,
  {
    let Some(cached) = self.lookup_or_miss(partition, key) else {
      let response = fetcher().await?;
      self.store(partition, key, StrategyKind::StaleWhileRevalidate, &response);
      return Ok(CacheResult::from_network(response));
    };

    let layer = self.clone();
    let partition_name = partition.to_string();
    let key_name = key.to_string();
    let refresh = fetcher();
    tokio::spawn(async move {
      match refresh.await {
        Ok(response) => {
          if let Err(e) = layer.revalidate(&partition_name, &key_name, &response) {
            warn!(key = %key_name, error = %e, "failed to store revalidated response");
          }
        }
        Err(e) => debug!(key = %key_name, error = %e, "background revalidation failed"),
      }
    });

    Ok(CacheResult::from_cache(
      cached.response,
      cached.cached_at,
      true,
    ))
  }

  /// Store a revalidated response; an identical response only refreshes the timestamp.
  fn revalidate(&self, partition: &str, key: &str, response: &StoredResponse) -> WorkerResult<()> {
    if let Some(existing) = self.storage.get(partition, key)? {
      if existing.response.digest() == response.digest() {
        self.storage.touch(partition, key, Utc::now())?;
        return Ok(());
      }
    }
    self.try_store(partition, key, StrategyKind::StaleWhileRevalidate, response)
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      policies: Arc::clone(&self.policies),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn layer() -> CacheLayer<SqliteStorage> {
    let policies = BTreeMap::from([(
      "pages".to_string(),
      ExpirationPolicy {
        max_entries: 10,
        max_age: chrono::Duration::hours(1),
      },
    )]);
    CacheLayer::new(Arc::new(SqliteStorage::in_memory().unwrap()), policies)
  }

  fn ok(body: &'static str) -> impl Future<Output = WorkerResult<StoredResponse>> {
    async move { Ok(StoredResponse::new(200, body)) }
  }

  fn offline() -> impl Future<Output = WorkerResult<StoredResponse>> {
    async { Err(WorkerError::network("/x", "offline")) }
  }

  #[tokio::test]
  async fn test_cache_first_fetches_once() {
    let layer = layer();
    let calls = AtomicU32::new(0);

    for _ in 0..2 {
      let result = layer
        .cache_first("pages", "/index.html", || {
          calls.fetch_add(1, Ordering::SeqCst);
          ok("home")
        })
        .await
        .unwrap();
      assert_eq!(result.data.body, b"home");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_propagates_network_failure() {
    let layer = layer();
    let err = layer
      .cache_first("pages", "/missing", offline)
      .await
      .unwrap_err();
    assert!(matches!(err, WorkerError::NetworkFailure { .. }));
  }

  #[tokio::test]
  async fn test_cache_first_expired_entry_refetches() {
    let layer = layer();
    let mut stale = CacheEntry::new(
      "pages",
      "/a",
      StrategyKind::CacheFirst,
      StoredResponse::new(200, "old"),
    );
    stale.cached_at = Utc::now() - chrono::Duration::hours(2);
    layer.storage().put(&stale).unwrap();

    let result = layer.cache_first("pages", "/a", || ok("new")).await.unwrap();
    assert_eq!(result.source, crate::cache::CacheSource::Network);
    assert_eq!(result.data.body, b"new");
  }

  #[tokio::test]
  async fn test_non_success_is_not_stored() {
    let layer = layer();
    layer
      .cache_first("pages", "/err", || async {
        Ok(StoredResponse::new(500, "boom"))
      })
      .await
      .unwrap();
    assert!(layer.lookup("pages", "/err").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_network_first_timeout_falls_back() {
    let layer = layer();
    layer.cache_first("pages", "/a", || ok("cached")).await.unwrap();

    let started = tokio::time::Instant::now();
    let result = layer
      .network_first("pages", "/a", Duration::from_millis(50), || async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(StoredResponse::new(200, "late"))
      })
      .await
      .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.source, crate::cache::CacheSource::Offline);
    assert_eq!(result.data.body, b"cached");
  }

  #[tokio::test]
  async fn test_network_first_timeout_without_cache_fails() {
    let layer = layer();
    let err = layer
      .network_first("pages", "/a", Duration::from_millis(20), || async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(StoredResponse::new(200, "late"))
      })
      .await
      .unwrap_err();
    assert!(matches!(err, WorkerError::Timeout { .. }));
  }

  /// Storage whose reads work but whose writes always fail.
  struct ReadOnlyStorage(SqliteStorage);

  impl CacheStorage for ReadOnlyStorage {
    fn put(&self, _entry: &CacheEntry) -> color_eyre::Result<()> {
      Err(color_eyre::eyre::eyre!("disk full"))
    }

    fn get(&self, partition: &str, url: &str) -> color_eyre::Result<Option<CacheEntry>> {
      self.0.get(partition, url)
    }

    fn delete(&self, partition: &str, url: &str) -> color_eyre::Result<bool> {
      self.0.delete(partition, url)
    }

    fn touch(&self, partition: &str, url: &str, at: chrono::DateTime<Utc>) -> color_eyre::Result<()> {
      self.0.touch(partition, url, at)
    }

    fn entries_by_age(
      &self,
      partition: &str,
    ) -> color_eyre::Result<Vec<(String, chrono::DateTime<Utc>)>> {
      self.0.entries_by_age(partition)
    }

    fn partitions(&self) -> color_eyre::Result<Vec<String>> {
      self.0.partitions()
    }

    fn delete_partition(&self, partition: &str) -> color_eyre::Result<usize> {
      self.0.delete_partition(partition)
    }
  }

  /// Storage where every call fails.
  struct BrokenStorage;

  impl CacheStorage for BrokenStorage {
    fn put(&self, _entry: &CacheEntry) -> color_eyre::Result<()> {
      Err(color_eyre::eyre::eyre!("disk full"))
    }

    fn get(&self, _partition: &str, _url: &str) -> color_eyre::Result<Option<CacheEntry>> {
      Err(color_eyre::eyre::eyre!("database is locked"))
    }

    fn delete(&self, _partition: &str, _url: &str) -> color_eyre::Result<bool> {
      Err(color_eyre::eyre::eyre!("database is locked"))
    }

    fn touch(&self, _partition: &str, _url: &str, _at: chrono::DateTime<Utc>) -> color_eyre::Result<()> {
      Err(color_eyre::eyre::eyre!("database is locked"))
    }

    fn entries_by_age(
      &self,
      _partition: &str,
    ) -> color_eyre::Result<Vec<(String, chrono::DateTime<Utc>)>> {
      Err(color_eyre::eyre::eyre!("database is locked"))
    }

    fn partitions(&self) -> color_eyre::Result<Vec<String>> {
      Err(color_eyre::eyre::eyre!("database is locked"))
    }

    fn delete_partition(&self, _partition: &str) -> color_eyre::Result<usize> {
      Err(color_eyre::eyre::eyre!("database is locked"))
    }
  }

  #[tokio::test]
  async fn test_failed_cache_write_still_returns_network_response() {
    let layer = CacheLayer::new(
      Arc::new(ReadOnlyStorage(SqliteStorage::in_memory().unwrap())),
      BTreeMap::new(),
    );

    let result = layer
      .network_first("pages", "/api/fires", Duration::from_secs(1), || ok("fresh"))
      .await
      .unwrap();
    assert_eq!(result.source, crate::cache::CacheSource::Network);
    assert_eq!(result.data.body, b"fresh");

    let result = layer.cache_first("pages", "/", || ok("home")).await.unwrap();
    assert_eq!(result.data.body, b"home");

    let result = layer
      .stale_while_revalidate("pages", "/app.js", || ok("code"))
      .await
      .unwrap();
    assert_eq!(result.data.body, b"code");
    assert!(layer.lookup("pages", "/app.js").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_failed_cache_read_falls_through_to_network() {
    let layer = CacheLayer::new(Arc::new(BrokenStorage), BTreeMap::new());

    let result = layer.cache_first("pages", "/", || ok("home")).await.unwrap();
    assert_eq!(result.source, crate::cache::CacheSource::Network);
    assert_eq!(result.data.body, b"home");

    let err = layer
      .network_first("pages", "/api/fires", Duration::from_secs(1), offline)
      .await
      .unwrap_err();
    assert!(matches!(err, WorkerError::NetworkFailure { .. }));
  }

  #[tokio::test]
  async fn test_network_first_prefers_network() {
    let layer = layer();
    layer.cache_first("pages", "/a", || ok("v1")).await.unwrap();

    let result = layer
      .network_first("pages", "/a", Duration::from_secs(1), || ok("v2"))
      .await
      .unwrap();
    assert_eq!(result.data.body, b"v2");
    let stored = layer.lookup("pages", "/a").unwrap().unwrap();
    assert_eq!(stored.response.body, b"v2");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_cache_then_refreshes() {
    let layer = layer();
    layer.cache_first("pages", "/app.js", || ok("v1")).await.unwrap();

    let result = layer
      .stale_while_revalidate("pages", "/app.js", || ok("v2"))
      .await
      .unwrap();
    assert_eq!(result.source, crate::cache::CacheSource::CacheStale);
    assert_eq!(result.data.body, b"v1");

    let mut refreshed = false;
    for _ in 0..50 {
      tokio::time::sleep(Duration::from_millis(10)).await;
      let entry = layer.lookup("pages", "/app.js").unwrap().unwrap();
      if entry.response.body == b"v2" {
        refreshed = true;
        break;
      }
    }
    assert!(refreshed, "background revalidation never stored v2");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_identical_response_keeps_entry() {
    let layer = layer();
    layer.cache_first("pages", "/logo.svg", || ok("same")).await.unwrap();

    layer
      .stale_while_revalidate("pages", "/logo.svg", || ok("same"))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let entry = layer.lookup("pages", "/logo.svg").unwrap().unwrap();
    assert_eq!(entry.response.body, b"same");
    assert_eq!(entry.strategy, StrategyKind::CacheFirst);
  }
}
