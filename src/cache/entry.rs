//! Stored response and cache entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::StrategyKind;

/// A response serialized for the cache store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
  pub status: u16,
  /// Header pairs in the order the server sent them
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl StoredResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Answer for a request that neither the network nor the cache could serve.
  pub fn unavailable() -> Self {
    Self::new(404, "resource unavailable offline").with_header("content-type", "text/plain")
  }

  /// Answer for a mutation parked in the sync queue.
  pub fn queued(id: i64) -> Self {
    Self::new(202, format!("{{\"queued\":true,\"id\":{}}}", id))
      .with_header("content-type", "application/json")
  }

  /// Content digest used to detect unchanged revalidations.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.status.to_be_bytes());
    for (name, value) in &self.headers {
      if name.eq_ignore_ascii_case("date") {
        continue;
      }
      hasher.update(name.as_bytes());
      hasher.update(value.as_bytes());
    }
    hasher.update(&self.body);
    hex::encode(hasher.finalize())
  }
}

/// One response stored under (partition, url).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub partition: String,
  /// Normalized request URL
  pub url: String,
  pub response: StoredResponse,
  pub strategy: StrategyKind,
  pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(
    partition: &str,
    url: &str,
    strategy: StrategyKind,
    response: StoredResponse,
  ) -> Self {
    Self {
      partition: partition.to_string(),
      url: url.to_string(),
      response,
      strategy,
      cached_at: Utc::now(),
    }
  }
}

impl StrategyKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      StrategyKind::CacheFirst => "cache-first",
      StrategyKind::NetworkFirst => "network-first",
      StrategyKind::StaleWhileRevalidate => "stale-while-revalidate",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "cache-first" => Some(StrategyKind::CacheFirst),
      "network-first" => Some(StrategyKind::NetworkFirst),
      "stale-while-revalidate" => Some(StrategyKind::StaleWhileRevalidate),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_digest_ignores_date_header() {
    let a = StoredResponse::new(200, "ok").with_header("date", "Mon, 19 Oct 2026 10:00:00 GMT");
    let b = StoredResponse::new(200, "ok").with_header("date", "Mon, 19 Oct 2026 10:05:00 GMT");
    assert_eq!(a.digest(), b.digest());
  }

  #[test]
  fn test_digest_changes_with_body() {
    let a = StoredResponse::new(200, "v1");
    let b = StoredResponse::new(200, "v2");
    assert_ne!(a.digest(), b.digest());
  }

  #[test]
  fn test_strategy_names() {
    for kind in [
      StrategyKind::CacheFirst,
      StrategyKind::NetworkFirst,
      StrategyKind::StaleWhileRevalidate,
    ] {
      assert_eq!(StrategyKind::parse(kind.as_str()), Some(kind));
    }
    assert_eq!(StrategyKind::parse("network-only"), None);
  }
}
