//! Offline mutation queue with strictly sequential FIFO delivery.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{format_datetime, parse_datetime, SqliteStorage};
use crate::config::SyncConfig;
use crate::error::WorkerResult;

/// One offline mutation waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncQueueItem {
  pub id: i64,
  pub method: String,
  pub url: String,
  pub body: Option<Vec<u8>>,
  pub created_at: DateTime<Utc>,
  pub retry_count: u32,
}

/// Persistence for the queue. Items come back in creation order.
pub trait SyncStore: Send + Sync {
  fn enqueue(&self, method: &str, url: &str, body: Option<&[u8]>) -> Result<i64>;

  fn pending(&self) -> Result<Vec<SyncQueueItem>>;

  fn remove(&self, id: i64) -> Result<()>;

  /// Count one more failed attempt. Returns the new retry count.
  fn record_failure(&self, id: i64, error: &str) -> Result<u32>;
}

impl SyncStore for SqliteStorage {
  fn enqueue(&self, method: &str, url: &str, body: Option<&[u8]>) -> Result<i64> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO sync_queue (method, url, body, created_at) VALUES (?, ?, ?, ?)",
        params![method, url, body, format_datetime(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation for {}: {}", url, e))?;
    Ok(conn.last_insert_rowid())
  }

  fn pending(&self) -> Result<Vec<SyncQueueItem>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, method, url, body, created_at, retry_count FROM sync_queue
         ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare sync queue query: {}", e))?;

    let rows: Vec<(i64, String, String, Option<Vec<u8>>, String, u32)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query sync queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read sync queue row: {}", e))?;

    rows
      .into_iter()
      .map(|(id, method, url, body, created_at, retry_count)| {
        Ok(SyncQueueItem {
          id,
          method,
          url,
          body,
          created_at: parse_datetime(&created_at)?,
          retry_count,
        })
      })
      .collect()
  }

  fn remove(&self, id: i64) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sync item {}: {}", id, e))?;
    Ok(())
  }

  fn record_failure(&self, id: i64, error: &str) -> Result<u32> {
    let conn = self.lock()?;
    conn
      .query_row(
        "UPDATE sync_queue SET retry_count = retry_count + 1, last_error = ?
         WHERE id = ?
         RETURNING retry_count",
        params![error, id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to record sync failure for {}: {}", id, e))
  }
}

/// An item that exhausted its retry budget and was dropped from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
  pub id: i64,
  pub url: String,
  pub retries: u32,
  pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Ids delivered during this drain, in order
  pub delivered: Vec<i64>,
  pub dead: Vec<DeadLetter>,
  /// Id of the item that failed and stopped the drain
  pub blocked_on: Option<i64>,
  /// When to try again, set whenever the drain stopped early
  pub retry_after: Option<Duration>,
  /// The backoff from an earlier failure had not elapsed, nothing was attempted
  pub deferred: bool,
}

pub struct SyncQueue<S: SyncStore> {
  store: Arc<S>,
  max_retries: u32,
  base_backoff: Duration,
  max_backoff: Duration,
  /// Held for the whole drain; earliest moment the next drain may deliver
  not_before: Mutex<Option<Instant>>,
}

impl<S: SyncStore> SyncQueue<S> {
  pub fn new(store: Arc<S>, config: &SyncConfig) -> Self {
    Self {
      store,
      max_retries: config.max_retries.max(1),
      base_backoff: Duration::from_secs(config.base_backoff_secs),
      max_backoff: Duration::from_secs(config.max_backoff_secs),
      not_before: Mutex::new(None),
    }
  }

  pub fn enqueue(&self, method: &str, url: &str, body: Option<&[u8]>) -> Result<i64> {
    let id = self.store.enqueue(method, url, body)?;
    info!(id, method, url, "queued offline mutation");
    Ok(id)
  }

  pub fn pending(&self) -> Result<Vec<SyncQueueItem>> {
    self.store.pending()
  }

  /// Delay before the next attempt after `retries` failures.
  pub fn backoff(&self, retries: u32) -> Duration {
    let exponent = retries.saturating_sub(1).min(16);
    self
      .base_backoff
      .saturating_mul(1u32 << exponent)
      .min(self.max_backoff)
  }

  /// Deliver queued items one at a time in creation order.
  ///
  /// A failure leaves the item queued and stops the drain, so nothing behind it
  /// is attempted first. Once an item reaches `max_retries` failures it is dropped
  /// as a dead letter and the drain moves on. Concurrent drains wait for each other,
  /// and a drain that starts before the last failure's backoff has elapsed is deferred.
  pub async fn drain<F, Fut>(&self, deliver: F) -> Result<DrainReport>
  where
    F: Fn(SyncQueueItem) -> Fut,
    Fut: Future<Output = WorkerResult<()>>,
  {
    let mut not_before = self.not_before.lock().await;
    let mut report = DrainReport::default();

    if let Some(at) = *not_before {
      if Instant::now() < at {
        debug!(remaining = ?(at - Instant::now()), "sync backoff still running, drain deferred");
        report.deferred = true;
        return Ok(report);
      }
    }
    *not_before = None;

    for item in self.store.pending()? {
      let id = item.id;
      let url = item.url.clone();
      match deliver(item).await {
        Ok(()) => {
          self.store.remove(id)?;
          debug!(id, url = %url, "delivered queued mutation");
          report.delivered.push(id);
        }
        Err(e) => {
          let error = e.to_string();
          let retries = self.store.record_failure(id, &error)?;
          if retries >= self.max_retries {
            warn!(id, url = %url, retries, error = %error, "giving up on queued mutation");
            self.store.remove(id)?;
            report.dead.push(DeadLetter {
              id,
              url,
              retries,
              error,
            });
            continue;
          }

          let delay = self.backoff(retries);
          debug!(id, retries, ?delay, error = %error, "delivery failed, will retry");
          report.blocked_on = Some(id);
          report.retry_after = Some(delay);
          *not_before = Some(Instant::now() + delay);
          break;
        }
      }
    }

    Ok(report)
  }
}
