//! Per-partition expiration: an entry-count cap plus a maximum age.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use tracing::debug;

use super::storage::CacheStorage;
use crate::config::PartitionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationPolicy {
  pub max_entries: usize,
  pub max_age: Duration,
}

impl From<PartitionConfig> for ExpirationPolicy {
  fn from(config: PartitionConfig) -> Self {
    Self {
      max_entries: config.max_entries,
      max_age: Duration::seconds(config.max_age_seconds as i64),
    }
  }
}

impl ExpirationPolicy {
  pub fn is_expired(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - cached_at > self.max_age
  }

  /// Evict entries older than `max_age`, then the oldest entries beyond `max_entries`.
  ///
  /// Returns the number of evicted entries.
  pub fn enforce<S: CacheStorage + ?Sized>(
    &self,
    storage: &S,
    partition: &str,
    now: DateTime<Utc>,
  ) -> Result<usize> {
    let entries = storage.entries_by_age(partition)?;
    let mut evicted = 0;

    let (expired, live): (Vec<_>, Vec<_>) = entries
      .into_iter()
      .partition(|(_, cached_at)| self.is_expired(*cached_at, now));

    for (url, _) in &expired {
      if storage.delete(partition, url)? {
        evicted += 1;
      }
    }

    // `live` is still oldest first
    let overflow = live.len().saturating_sub(self.max_entries);
    for (url, _) in live.iter().take(overflow) {
      if storage.delete(partition, url)? {
        evicted += 1;
      }
    }

    if evicted > 0 {
      debug!(partition, evicted, "evicted cache entries");
    }
    Ok(evicted)
  }
}
