//! Routes incoming requests to a cache strategy.

use color_eyre::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, ExpirationPolicy, StoredResponse};
use crate::config::{Config, StrategyKind};
use crate::error::{WorkerError, WorkerResult};
use crate::network::{self, HttpClient, Request};
use crate::router::Router;

/// Strategy dispatcher. Owns every cache partition it writes to.
pub struct Dispatcher<S: CacheStorage> {
  origin: Url,
  router: Arc<Router>,
  cache: CacheLayer<S>,
  http: HttpClient,
}

impl<S: CacheStorage + 'static> Dispatcher<S> {
  pub fn new(config: &Config, storage: Arc<S>, http: HttpClient) -> Result<Self> {
    let origin = Url::parse(&config.origin)?;
    let policies: BTreeMap<String, ExpirationPolicy> = config
      .partitions
      .iter()
      .map(|(name, policy)| (name.clone(), ExpirationPolicy::from(*policy)))
      .collect();

    Ok(Self {
      origin,
      router: Arc::new(Router::from_config(config)?),
      cache: CacheLayer::new(storage, policies),
      http,
    })
  }

  #[cfg(test)]
  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn http(&self) -> &HttpClient {
    &self.http
  }

  pub fn storage(&self) -> &Arc<S> {
    self.cache.storage()
  }

  #[cfg(test)]
  pub fn router(&self) -> &Router {
    &self.router
  }

  /// Normalized cache key for a URL.
  pub fn key_for(&self, url: &Url) -> String {
    network::cache_key(&self.origin, url)
  }

  /// Serve a request through the strategy its URL routes to.
  ///
  /// Only GET requests touch the cache; anything else goes straight to the network.
  pub async fn handle(&self, request: &Request) -> WorkerResult<CacheResult<StoredResponse>> {
    if !request.is_get() {
      let response = self.http.fetch(request).await?;
      return Ok(CacheResult::from_network(response));
    }

    let route = self.router.route(&request.url);
    let key = self.key_for(&request.url);
    let partition = route.partition.as_str();
    debug!(key = %key, partition, strategy = route.strategy.as_str(), "dispatch");

    let http = self.http.clone();
    let fetch_request = request.clone();
    let fetcher = move || async move { http.fetch(&fetch_request).await };

    match route.strategy {
      StrategyKind::CacheFirst => self.cache.cache_first(partition, &key, fetcher).await,
      StrategyKind::NetworkFirst => {
        self
          .cache
          .network_first(partition, &key, route.timeout, fetcher)
          .await
      }
      StrategyKind::StaleWhileRevalidate => {
        self
          .cache
          .stale_while_revalidate(partition, &key, fetcher)
          .await
      }
    }
  }

  /// Whether a live entry exists for the URL in the partition it routes to.
  pub fn is_cached(&self, url: &Url) -> WorkerResult<bool> {
    let route = self.router.route(url);
    Ok(
      self
        .cache
        .lookup(&route.partition, &self.key_for(url))?
        .is_some(),
    )
  }

  /// Read the URL's entry without touching the network.
  pub fn cached(&self, url: &Url) -> WorkerResult<CacheResult<StoredResponse>> {
    let route = self.router.route(url);
    let key = self.key_for(url);
    match self.cache.lookup(&route.partition, &key)? {
      Some(entry) => Ok(CacheResult::from_cache(entry.response, entry.cached_at, false)),
      None => Err(WorkerError::CacheMiss {
        url: key,
        partition: route.partition.clone(),
      }),
    }
  }

  /// Populate the cache for a URL through the cache-first path.
  ///
  /// Returns true when the network was hit.
  pub async fn preload(&self, url: &Url) -> WorkerResult<bool> {
    let route = self.router.route(url);
    let request = Request::get(url.clone());
    let http = self.http.clone();
    let result = self
      .cache
      .cache_first(&route.partition, &self.key_for(url), move || async move {
        http.fetch(&request).await
      })
      .await?;
    Ok(!result.is_from_cache())
  }

  /// Resolve raw host input into a request against this origin.
  pub fn request(&self, method: &str, raw_url: &str, body: Option<Vec<u8>>) -> WorkerResult<Request> {
    Request::parse(&self.origin, method, raw_url, body)
  }

  /// Remove partitions the current route table no longer uses.
  pub fn purge_unknown_partitions(&self) -> WorkerResult<Vec<String>> {
    let known: Vec<&str> = self.router.partitions().collect();
    let mut removed = Vec::new();
    for partition in self.storage().partitions()? {
      if !known.contains(&partition.as_str()) {
        self.storage().delete_partition(&partition)?;
        removed.push(partition);
      }
    }
    Ok(removed)
  }

  pub fn resolve(&self, raw_url: &str) -> WorkerResult<Url> {
    network::resolve(&self.origin, raw_url)
  }
}

impl<S: CacheStorage> Clone for Dispatcher<S> {
  fn clone(&self) -> Self {
    Self {
      origin: self.origin.clone(),
      router: Arc::clone(&self.router),
      cache: self.cache.clone(),
      http: self.http.clone(),
    }
  }
}
