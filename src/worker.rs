use chrono::Utc;
use color_eyre::Result;
use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheResult, CacheSource, SqliteStorage, StoredResponse};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{WorkerError, WorkerResult};
use crate::event::{Event, EventHandler};
use crate::host::{HostCommand, HostEvent};
use crate::message::ClientMessage;
use crate::network::{HttpClient, Request};
use crate::notifier::{push, DrainReport, SyncQueue, UpdateNotifier};
use crate::preload::PreloadScheduler;
use crate::tracker::UsageTracker;

type Storage = SqliteStorage;

/// Worker state, owned by the event loop and handed to each handler by reference.
pub struct Worker {
  config: Config,
  dispatcher: Dispatcher<Storage>,
  tracker: UsageTracker,
  scheduler: PreloadScheduler<Storage>,
  updates: UpdateNotifier,
  sync: Arc<SyncQueue<Storage>>,
  sync_driver: SyncDriver,

  /// Commands for the host
  commands: mpsc::UnboundedSender<HostCommand>,

  /// Loops events back into our own queue (sync retries, triggered ticks)
  events: mpsc::UnboundedSender<Event>,
}

impl Worker {
  pub fn new(
    config: Config,
    storage: Arc<Storage>,
    commands: mpsc::UnboundedSender<HostCommand>,
    events: mpsc::UnboundedSender<Event>,
  ) -> Result<Self> {
    let http = HttpClient::new()?;
    let dispatcher = Dispatcher::new(&config, Arc::clone(&storage), http)?;
    let scheduler = PreloadScheduler::new(&config.preload, dispatcher.clone());
    let sync = Arc::new(SyncQueue::new(storage, &config.sync));
    let sync_driver = SyncDriver {
      queue: Arc::clone(&sync),
      http: dispatcher.http().clone(),
      commands: commands.clone(),
      events: events.clone(),
      retry_timer: Arc::new(StdMutex::new(None)),
    };

    Ok(Self {
      tracker: UsageTracker::new(&config.tracker),
      updates: UpdateNotifier::new(config.version.clone()),
      config,
      dispatcher,
      scheduler,
      sync,
      sync_driver,
      commands,
      events,
    })
  }

  /// Process events until the host closes its input.
  pub async fn run(&mut self, mut events: EventHandler) -> Result<()> {
    info!(version = %self.config.version, origin = %self.config.origin, "worker started");

    while let Some(event) = events.next().await {
      if matches!(event, Event::Shutdown) {
        break;
      }
      self.handle_event(event).await;
    }

    info!("host input closed, worker stopping");
    Ok(())
  }

  pub async fn handle_event(&mut self, event: Event) {
    match event {
      Event::Host(host_event) => self.handle_host_event(host_event).await,
      Event::Tick => self.spawn_tick(),
      Event::SyncDue => self.spawn_sync(None),
      Event::Malformed(error) => warn!(error = %error, "ignoring host input"),
      Event::Shutdown => {}
    }
  }

  async fn handle_host_event(&mut self, event: HostEvent) {
    let name = event.name();
    match event {
      HostEvent::Install => {
        self.install().await;
        self.send(HostCommand::ack(name));
      }
      HostEvent::Activate => {
        if let Err(e) = self.activate() {
          warn!(error = %e, "failed to clean up old cache partitions");
        }
        self.send(HostCommand::ack(name));
      }
      HostEvent::Fetch {
        id,
        url,
        method,
        body,
      } => self.spawn_fetch(id, &method, &url, body.map(String::into_bytes)),
      HostEvent::Message { data } => {
        self.handle_message(&data);
        self.send(HostCommand::ack(name));
      }
      HostEvent::Sync { tag } => {
        debug!(tag = ?tag, "sync requested by host");
        self.spawn_sync(Some(name));
      }
      HostEvent::Push { data } => {
        self.send(push::notification(data.as_deref(), &self.config.push));
        self.send(HostCommand::ack(name));
      }
      HostEvent::NotificationClick { url } => {
        self.send(push::click_target(url.as_deref()));
        self.send(HostCommand::ack(name));
      }
      HostEvent::Online => {
        self.set_online(true);
        self.spawn_sync(None);
      }
      HostEvent::Offline => self.set_online(false),
      HostEvent::ControllerChange => {
        if let Some(command) = self.updates.controller_changed() {
          self.send(command);
        }
      }
      HostEvent::VersionWaiting { version } => {
        if let Some(command) = self.updates.detect(&version) {
          self.send(command);
        }
      }
    }
  }

  /// Precache the configured URLs. Returns how many are now cached.
  pub async fn install(&self) -> usize {
    let mut cached = 0;
    for raw in &self.config.precache {
      let result = match self.dispatcher.resolve(raw) {
        Ok(url) => self.dispatcher.preload(&url).await,
        Err(e) => Err(e),
      };
      match result {
        Ok(_) => cached += 1,
        Err(e) => warn!(url = %raw, error = %e, "precache failed"),
      }
    }
    info!(cached, total = self.config.precache.len(), "install finished");
    cached
  }

  /// Drop cache partitions from previous configurations.
  pub fn activate(&self) -> WorkerResult<Vec<String>> {
    let removed = self.dispatcher.purge_unknown_partitions()?;
    if !removed.is_empty() {
      info!(?removed, "removed outdated cache partitions");
    }
    Ok(removed)
  }

  fn spawn_fetch(&mut self, id: u64, method: &str, raw_url: &str, body: Option<Vec<u8>>) {
    let request = match self.dispatcher.request(method, raw_url, body) {
      Ok(request) => request,
      Err(e) => {
        warn!(id, error = %e, "rejecting fetch");
        self.send(HostCommand::respond(id, &StoredResponse::unavailable(), None));
        return;
      }
    };
    self.track(&request);

    let dispatcher = self.dispatcher.clone();
    let sync = Arc::clone(&self.sync);
    let commands = self.commands.clone();
    tokio::spawn(async move {
      let (response, source) = into_response(serve(&dispatcher, &sync, request).await);
      let _ = commands.send(HostCommand::respond(id, &response, source));
    });
  }

  /// Serve one request and wait for the result.
  pub async fn fetch(&mut self, request: Request) -> WorkerResult<CacheResult<StoredResponse>> {
    self.track(&request);
    serve(&self.dispatcher, &self.sync, request).await
  }

  fn track(&mut self, request: &Request) {
    if request.is_get() {
      let key = self.dispatcher.key_for(&request.url);
      self.tracker.record_access(&key);
    }
  }

  pub fn handle_message(&mut self, data: &Value) {
    let message = match ClientMessage::parse(data) {
      Ok(Some(message)) => message,
      Ok(None) => {
        debug!(%data, "ignoring unrecognized message");
        return;
      }
      Err(e) => {
        warn!(error = %e, "ignoring message");
        return;
      }
    };

    match message {
      ClientMessage::SkipWaiting | ClientMessage::AcceptUpdate => {
        if let Some(command) = self.updates.accept() {
          self.send(command);
        }
      }
      ClientMessage::DismissUpdate => {
        self.updates.dismiss();
      }
      ClientMessage::UpdateResourcePriority { url, priority } => {
        let key = match self.dispatcher.resolve(&url) {
          Ok(resolved) => self.dispatcher.key_for(&resolved),
          Err(e) => {
            warn!(url = %url, error = %e, "ignoring priority update");
            return;
          }
        };
        self.tracker.update_priority(&key, priority);
        debug!(key = %key, priority, "resource priority updated");
        let _ = self.events.send(Event::Tick);
      }
    }
  }

  /// Run one preload tick to completion.
  #[cfg(test)]
  pub async fn preload_tick(&self) -> crate::preload::PreloadReport {
    let candidates = self
      .tracker
      .candidates(self.scheduler.min_priority(), Utc::now());
    self.scheduler.tick(candidates).await
  }

  fn spawn_tick(&self) {
    let candidates = self
      .tracker
      .candidates(self.scheduler.min_priority(), Utc::now());
    let scheduler = self.scheduler.clone();
    tokio::spawn(async move {
      scheduler.tick(candidates).await;
    });
  }

  /// Drain the sync queue now and wait for the outcome.
  pub async fn sync_now(&self) -> Result<DrainReport> {
    self.sync_driver.drain().await
  }

  fn spawn_sync(&self, ack: Option<&'static str>) {
    let driver = self.sync_driver.clone();
    tokio::spawn(async move {
      if let Err(e) = driver.drain().await {
        warn!(error = %e, "sync drain failed");
      }
      if let Some(event) = ack {
        let _ = driver.commands.send(HostCommand::ack(event));
      }
    });
  }

  pub fn set_online(&self, online: bool) {
    info!(online, "connectivity changed");
    self.dispatcher.http().set_online(online);
  }

  #[cfg(test)]
  pub fn update_state(&self) -> &crate::notifier::UpdateState {
    self.updates.state()
  }

  #[cfg(test)]
  pub fn tracker(&self) -> &UsageTracker {
    &self.tracker
  }

  pub fn dispatcher(&self) -> &Dispatcher<Storage> {
    &self.dispatcher
  }

  pub fn sync_queue(&self) -> &SyncQueue<Storage> {
    &self.sync
  }

  fn send(&self, command: HostCommand) {
    if self.commands.send(command).is_err() {
      debug!("host command channel closed");
    }
  }
}

/// Dispatch a request. A mutation that can't reach the network is queued for sync
/// and answered with 202.
async fn serve(
  dispatcher: &Dispatcher<Storage>,
  sync: &SyncQueue<Storage>,
  request: Request,
) -> WorkerResult<CacheResult<StoredResponse>> {
  match dispatcher.handle(&request).await {
    Err(WorkerError::NetworkFailure { status: None, .. } | WorkerError::Timeout { .. })
      if !request.is_get() =>
    {
      let id = sync.enqueue(
        request.method.as_str(),
        request.url.as_str(),
        request.body.as_deref(),
      )?;
      Ok(CacheResult {
        data: StoredResponse::queued(id),
        source: CacheSource::Offline,
        cached_at: None,
      })
    }
    other => other,
  }
}

/// Turn a dispatch result into what the host gets back. Failures become a 404.
pub fn into_response(
  result: WorkerResult<CacheResult<StoredResponse>>,
) -> (StoredResponse, Option<CacheSource>) {
  match result {
    Ok(result) => (result.data, Some(result.source)),
    Err(e) if e.is_recoverable() => {
      debug!(error = %e, "request failed, answering unavailable");
      (StoredResponse::unavailable(), None)
    }
    Err(e) => {
      warn!(error = %e, "request failed, answering unavailable");
      (StoredResponse::unavailable(), None)
    }
  }
}

/// Drains the sync queue and reports the outcome to the host.
///
/// At most one retry timer is pending at a time; scheduling a new one aborts the old.
#[derive(Clone)]
struct SyncDriver {
  queue: Arc<SyncQueue<Storage>>,
  http: HttpClient,
  commands: mpsc::UnboundedSender<HostCommand>,
  events: mpsc::UnboundedSender<Event>,
  retry_timer: Arc<StdMutex<Option<AbortHandle>>>,
}

impl SyncDriver {
  async fn drain(&self) -> Result<DrainReport> {
    if !self.http.is_online() {
      debug!("offline, sync postponed until reconnect");
      return Ok(DrainReport::default());
    }

    let report = self
      .queue
      .drain(|item| {
        let http = self.http.clone();
        async move {
          let failure = |message: String| WorkerError::SyncDeliveryFailure {
            id: item.id,
            url: item.url.clone(),
            message,
          };
          let target = Url::parse(&item.url).map_err(|e| failure(e.to_string()))?;
          let request = Request::parse(&target, &item.method, &item.url, item.body.clone())
            .map_err(|e| failure(e.to_string()))?;
          http
            .fetch(&request)
            .await
            .map(|_| ())
            .map_err(|e| failure(e.to_string()))
        }
      })
      .await?;

    for dead in &report.dead {
      let _ = self.commands.send(HostCommand::SyncFailed {
        id: dead.id,
        url: dead.url.clone(),
        retries: dead.retries,
        error: dead.error.clone(),
      });
    }
    if !report.delivered.is_empty() {
      info!(delivered = report.delivered.len(), "sync queue drained");
      let _ = self.commands.send(HostCommand::SyncCompleted {
        delivered: report.delivered.len(),
      });
    }
    if let Some(delay) = report.retry_after {
      self.schedule_retry(delay);
    }

    Ok(report)
  }

  fn schedule_retry(&self, delay: Duration) {
    let _ = self.commands.send(HostCommand::ScheduleSync {
      after_secs: delay.as_secs(),
    });

    let events = self.events.clone();
    let timer = tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = events.send(Event::SyncDue);
    });

    match self.retry_timer.lock() {
      Ok(mut slot) => {
        if let Some(previous) = slot.replace(timer.abort_handle()) {
          previous.abort();
        }
      }
      Err(_) => warn!("sync retry timer slot poisoned"),
    }
  }
}
