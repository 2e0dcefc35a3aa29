//! Requests, cache-key normalization and the HTTP client.

use reqwest::Method;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::cache::StoredResponse;
use crate::error::{WorkerError, WorkerResult};

/// An outgoing request as seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      body: None,
    }
  }

  /// Build a request from raw host input, resolving relative URLs against `origin`.
  pub fn parse(origin: &Url, method: &str, raw_url: &str, body: Option<Vec<u8>>) -> WorkerResult<Self> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|e| {
      WorkerError::InvalidRequest {
        url: raw_url.to_string(),
        message: format!("invalid method {}: {}", method, e),
      }
    })?;
    Ok(Self {
      method,
      url: resolve(origin, raw_url)?,
      body,
    })
  }

  pub fn is_get(&self) -> bool {
    self.method == Method::GET
  }
}

/// Resolve a possibly relative URL against the origin and drop its fragment.
pub fn resolve(origin: &Url, raw: &str) -> WorkerResult<Url> {
  let mut url = origin.join(raw).map_err(|e| WorkerError::InvalidRequest {
    url: raw.to_string(),
    message: e.to_string(),
  })?;
  url.set_fragment(None);
  Ok(url)
}

/// Cache key for a URL: `path[?query]` on the origin, the full URL elsewhere.
pub fn cache_key(origin: &Url, url: &Url) -> String {
  if url.origin() == origin.origin() {
    match url.query() {
      Some(query) => format!("{}?{}", url.path(), query),
      None => url.path().to_string(),
    }
  } else {
    url.as_str().to_string()
  }
}

/// HTTP client with an explicit connectivity flag.
///
/// While offline every fetch fails immediately without touching the network.
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
  online: Arc<AtomicBool>,
}

impl HttpClient {
  pub fn new() -> WorkerResult<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("brigade-offline/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| WorkerError::network("", format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      online: Arc::new(AtomicBool::new(true)),
    })
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Perform the request. Non-2xx responses are reported as `NetworkFailure`.
  pub async fn fetch(&self, request: &Request) -> WorkerResult<StoredResponse> {
    let url = request.url.as_str();
    if !self.is_online() {
      return Err(WorkerError::network(url, "offline"));
    }

    debug!(method = %request.method, url, "network fetch");
    let mut builder = self.client.request(request.method.clone(), request.url.clone());
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| WorkerError::network(url, e.to_string()))?;

    let status = response.status();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| WorkerError::network(url, format!("failed to read body: {}", e)))?;

    if !status.is_success() {
      return Err(WorkerError::NetworkFailure {
        url: url.to_string(),
        status: Some(status.as_u16()),
        message: format!("server answered {}", status),
      });
    }

    Ok(StoredResponse {
      status: status.as_u16(),
      headers,
      body: body.to_vec(),
    })
  }
}
