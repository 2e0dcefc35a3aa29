//! Error types for request handling and background sync.

use std::time::Duration;

/// Errors surfaced by cache strategies, the sync queue and message parsing.
///
/// None of these are fatal to the worker: the worst outcome of any of them is a
/// degraded (uncached or synthetic) response.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
  /// The fetch was rejected, the worker is offline, or the server answered non-2xx.
  #[error("network failure for {url}: {message}")]
  NetworkFailure {
    url: String,
    status: Option<u16>,
    message: String,
  },

  /// No stored entry for a cache-first or fallback lookup.
  #[error("no cached entry for {url} in partition {partition}")]
  CacheMiss { url: String, partition: String },

  /// A network-first fetch exceeded its deadline and the cache had nothing either.
  #[error("network timed out after {timeout:?} for {url}")]
  Timeout { url: String, timeout: Duration },

  /// A queued mutation could not be delivered.
  #[error("sync delivery failed for item {id} ({url}): {message}")]
  SyncDeliveryFailure {
    id: i64,
    url: String,
    message: String,
  },

  /// An unparseable push or client message payload.
  #[error("malformed message: {0}")]
  MalformedMessage(String),

  /// The request URL could not be parsed or resolved.
  #[error("invalid request url {url}: {message}")]
  InvalidRequest { url: String, message: String },

  /// The persistent cache store failed.
  #[error("cache storage error: {0}")]
  Storage(String),
}

impl WorkerError {
  /// Network failure with no HTTP status (connection error, offline).
  pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
    Self::NetworkFailure {
      url: url.into(),
      status: None,
      message: message.into(),
    }
  }

  /// True for failures that a cache fallback can recover from.
  pub fn is_recoverable(&self) -> bool {
    matches!(
      self,
      Self::NetworkFailure { .. } | Self::Timeout { .. } | Self::CacheMiss { .. }
    )
  }
}

impl From<color_eyre::Report> for WorkerError {
  fn from(report: color_eyre::Report) -> Self {
    Self::Storage(report.to_string())
  }
}

pub type WorkerResult<T> = Result<T, WorkerError>;

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  #[test]
  fn test_storage_report_converts() {
    let err: WorkerError = eyre!("disk full").into();
    assert!(matches!(err, WorkerError::Storage(ref m) if m == "disk full"));
    assert!(!err.is_recoverable());
  }

  #[test]
  fn test_network_failure_is_recoverable() {
    let err = WorkerError::network("/index.html", "offline");
    assert!(err.is_recoverable());
    assert_eq!(
      err.to_string(),
      "network failure for /index.html: offline"
    );
  }
}
