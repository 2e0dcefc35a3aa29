//! Priority-driven cache preloading.

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::config::PreloadConfig;
use crate::dispatcher::Dispatcher;

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreloadReport {
  /// Another tick was still running, nothing was done
  pub skipped: bool,
  pub fetched: Vec<String>,
  pub failed: Vec<String>,
  /// Scheduled but not finished when the time window closed
  pub cancelled: usize,
}

/// Fetches high-priority resources into the cache in the background.
///
/// Ticks never overlap: a tick that starts while another is running returns a
/// skipped report immediately.
pub struct PreloadScheduler<S: CacheStorage> {
  dispatcher: Dispatcher<S>,
  min_priority: f64,
  max_concurrent: usize,
  window: Duration,
  running: Arc<AtomicBool>,
}

/// Clears the running flag when a tick ends, including on cancellation.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl<S: CacheStorage + 'static> PreloadScheduler<S> {
  pub fn new(config: &PreloadConfig, dispatcher: Dispatcher<S>) -> Self {
    Self {
      dispatcher,
      min_priority: config.min_priority,
      max_concurrent: config.max_concurrent.max(1),
      window: Duration::from_secs(config.window_secs),
      running: Arc::new(AtomicBool::new(false)),
    }
  }

  #[cfg(test)]
  pub fn with_window(mut self, window: Duration) -> Self {
    self.window = window;
    self
  }

  pub fn min_priority(&self) -> f64 {
    self.min_priority
  }

  /// Preload the given (url, priority) candidates.
  ///
  /// Candidates below `min_priority` or already cached are skipped; the rest are
  /// fetched highest priority first, `max_concurrent` at a time, until the window
  /// closes. Whatever is still pending then is dropped and retried next tick.
  pub async fn tick(&self, candidates: Vec<(String, f64)>) -> PreloadReport {
    if self.running.swap(true, Ordering::SeqCst) {
      debug!("preload tick already running, skipping");
      return PreloadReport {
        skipped: true,
        ..PreloadReport::default()
      };
    }
    let _guard = RunningGuard(Arc::clone(&self.running));

    let mut ranked: Vec<(String, f64)> = candidates
      .into_iter()
      .filter(|(_, priority)| *priority >= self.min_priority)
      .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut pending = Vec::new();
    for (raw, priority) in ranked {
      let url = match self.dispatcher.resolve(&raw) {
        Ok(url) => url,
        Err(e) => {
          warn!(url = %raw, error = %e, "skipping unresolvable preload candidate");
          continue;
        }
      };
      match self.dispatcher.is_cached(&url) {
        Ok(true) => continue,
        Ok(false) => pending.push((raw, url, priority)),
        Err(e) => warn!(url = %raw, error = %e, "cache lookup failed during preload"),
      }
    }

    let mut report = PreloadReport::default();
    if pending.is_empty() {
      return report;
    }

    let scheduled = pending.len();
    let deadline = tokio::time::Instant::now() + self.window;
    let mut fetches = futures::stream::iter(pending)
      .map(|(raw, url, priority)| {
        let dispatcher = self.dispatcher.clone();
        async move {
          debug!(url = %raw, priority, "preloading");
          (raw, dispatcher.preload(&url).await)
        }
      })
      .buffer_unordered(self.max_concurrent);

    loop {
      match tokio::time::timeout_at(deadline, fetches.next()).await {
        Ok(Some((raw, Ok(_)))) => report.fetched.push(raw),
        Ok(Some((raw, Err(e)))) => {
          debug!(url = %raw, error = %e, "preload failed");
          report.failed.push(raw);
        }
        Ok(None) => break,
        Err(_) => {
          report.cancelled = scheduled - report.fetched.len() - report.failed.len();
          warn!(cancelled = report.cancelled, "preload window closed");
          break;
        }
      }
    }

    info!(
      fetched = report.fetched.len(),
      failed = report.failed.len(),
      cancelled = report.cancelled,
      "preload tick finished"
    );
    report
  }
}

impl<S: CacheStorage> Clone for PreloadScheduler<S> {
  fn clone(&self) -> Self {
    Self {
      dispatcher: self.dispatcher.clone(),
      min_priority: self.min_priority,
      max_concurrent: self.max_concurrent,
      window: self.window,
      running: Arc::clone(&self.running),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::Config;
  use crate::network::HttpClient;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn scheduler(server: &MockServer, max_concurrent: usize) -> PreloadScheduler<SqliteStorage> {
    let mut config = Config::default();
    config.origin = server.uri();
    config.preload.max_concurrent = max_concurrent;
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());
    let dispatcher = Dispatcher::new(&config, storage, HttpClient::new().unwrap()).unwrap();
    PreloadScheduler::new(&config.preload, dispatcher)
  }

  async fn serve(server: &MockServer, at: &str, delay: Duration) {
    Mock::given(method("GET"))
      .and(path(at))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_string(at)
          .set_delay(delay),
      )
      .mount(server)
      .await;
  }

  #[tokio::test]
  async fn test_tick_fetches_candidates_above_threshold() {
    let server = MockServer::start().await;
    serve(&server, "/test-resource.js", Duration::ZERO).await;
    Mock::given(method("GET"))
      .and(path("/low.js"))
      .respond_with(ResponseTemplate::new(200))
      .expect(0)
      .mount(&server)
      .await;

    let scheduler = scheduler(&server, 3);
    let report = scheduler
      .tick(vec![
        ("/test-resource.js".to_string(), 0.9),
        ("/low.js".to_string(), 0.3),
      ])
      .await;

    assert_eq!(report.fetched, vec!["/test-resource.js"]);
    let url = scheduler.dispatcher.resolve("/test-resource.js").unwrap();
    assert!(scheduler.dispatcher.is_cached(&url).unwrap());
  }

  #[tokio::test]
  async fn test_already_cached_is_not_refetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/app.css"))
      .respond_with(ResponseTemplate::new(200).set_body_string("css"))
      .expect(1)
      .mount(&server)
      .await;

    let scheduler = scheduler(&server, 1);
    let candidates = vec![("/app.css".to_string(), 1.0)];
    assert_eq!(scheduler.tick(candidates.clone()).await.fetched.len(), 1);
    assert!(scheduler.tick(candidates).await.fetched.is_empty());
  }

  #[tokio::test]
  async fn test_window_cancels_remaining_fetches() {
    let server = MockServer::start().await;
    serve(&server, "/fast.js", Duration::ZERO).await;
    serve(&server, "/slow-a.js", Duration::from_secs(5)).await;
    serve(&server, "/slow-b.js", Duration::from_secs(5)).await;

    let scheduler = scheduler(&server, 1).with_window(Duration::from_millis(500));
    let started = tokio::time::Instant::now();
    let report = scheduler
      .tick(vec![
        ("/fast.js".to_string(), 1.0),
        ("/slow-a.js".to_string(), 0.95),
        ("/slow-b.js".to_string(), 0.9),
      ])
      .await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.fetched, vec!["/fast.js"]);
    assert_eq!(report.cancelled, 2);

    // The running flag was released, so the next tick is not skipped
    let next = scheduler.tick(Vec::new()).await;
    assert!(!next.skipped);
  }

  #[tokio::test]
  async fn test_overlapping_tick_is_skipped() {
    let server = MockServer::start().await;
    serve(&server, "/slow.js", Duration::from_millis(300)).await;

    let scheduler = scheduler(&server, 1);
    let (first, second) = tokio::join!(
      scheduler.tick(vec![("/slow.js".to_string(), 1.0)]),
      async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.tick(vec![("/slow.js".to_string(), 1.0)]).await
      }
    );

    assert!(!first.skipped);
    assert_eq!(first.fetched, vec!["/slow.js"]);
    assert!(second.skipped);
  }

  #[tokio::test]
  async fn test_failed_fetch_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/broken.js"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;

    let scheduler = scheduler(&server, 2);
    let report = scheduler
      .tick(vec![("/broken.js".to_string(), 1.0)])
      .await;
    assert_eq!(report.failed, vec!["/broken.js"]);
    assert!(report.fetched.is_empty());
  }
}
