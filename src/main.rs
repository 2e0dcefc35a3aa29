mod cache;
mod config;
mod dispatcher;
mod error;
mod event;
mod host;
mod logging;
mod message;
mod network;
mod notifier;
mod preload;
mod router;
mod tracker;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

use cache::{CacheStorage, SqliteStorage};
use config::Config;
use event::EventHandler;
use host::HostCommand;
use worker::Worker;

/// How long to wait for in-flight responses after the host closes stdin
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "brigade-offline")]
#[command(about = "Offline caching worker for the brigade dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./brigade-offline.yaml, then $XDG_CONFIG_HOME/brigade-offline/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(long, global = true)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the worker: host events on stdin, commands on stdout
  Run,
  /// Fetch one URL through the cache
  Fetch {
    url: String,
    /// Only read the cache, never the network
    #[arg(long)]
    cached: bool,
  },
  /// Queue a mutation for background sync
  Enqueue {
    #[arg(short, long, default_value = "POST")]
    method: String,
    #[arg(short, long)]
    url: String,
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Deliver queued mutations once
  Sync,
  /// Show cache partitions and sync queue length
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config::data_dir()?, args.log_stderr)?;

  let storage = Arc::new(SqliteStorage::open(&config.database_path()?)?);

  match args.command.unwrap_or(Command::Run) {
    Command::Run => run(config, storage).await,
    Command::Fetch { url, cached } => {
      let (mut worker, _commands) = detached_worker(config, storage)?;
      let request = worker.dispatcher().request("GET", &url, None)?;
      let result = if cached {
        worker.dispatcher().cached(&request.url)
      } else {
        worker.fetch(request).await
      };
      let cached_at = result.as_ref().ok().and_then(|r| r.cached_at);
      let (response, source) = worker::into_response(result);
      let source = source.map_or("none".to_string(), |s| format!("{:?}", s));
      let cached_at = cached_at.map_or("-".to_string(), |at| at.to_rfc3339());
      println!(
        "{} source={} cached_at={} bytes={}",
        response.status,
        source,
        cached_at,
        response.body.len()
      );
      Ok(())
    }
    Command::Enqueue { method, url, body } => {
      let (worker, _commands) = detached_worker(config, storage)?;
      let request = worker
        .dispatcher()
        .request(&method, &url, body.map(String::into_bytes))?;
      let id = worker.sync_queue().enqueue(
        request.method.as_str(),
        request.url.as_str(),
        request.body.as_deref(),
      )?;
      println!("queued {} {} as #{}", request.method, request.url, id);
      Ok(())
    }
    Command::Sync => {
      let (worker, _commands) = detached_worker(config, storage)?;
      let report = worker.sync_now().await?;
      println!(
        "delivered={} dead={} pending={}",
        report.delivered.len(),
        report.dead.len(),
        worker.sync_queue().pending()?.len()
      );
      if report.deferred {
        println!("backoff from an earlier failure still running, nothing attempted");
      }
      if let (Some(id), Some(delay)) = (report.blocked_on, report.retry_after) {
        println!("blocked on #{}, next attempt in {}s", id, delay.as_secs());
      }
      Ok(())
    }
    Command::Status => {
      for partition in storage.partitions()? {
        println!("{:<20} {}", partition, storage.count(&partition)?);
      }
      let (worker, _commands) = detached_worker(config, storage)?;
      println!("sync queue: {}", worker.sync_queue().pending()?.len());
      Ok(())
    }
  }
}

async fn run(config: Config, storage: Arc<SqliteStorage>) -> Result<()> {
  let events = EventHandler::new(Duration::from_secs(config.preload.interval_secs.max(1)));
  let (command_tx, mut command_rx) = mpsc::unbounded_channel::<HostCommand>();

  // Single writer so protocol lines never interleave
  let writer = tokio::spawn(async move {
    let mut stdout = tokio::io::stdout();
    while let Some(command) = command_rx.recv().await {
      match command.to_line() {
        Ok(line) => {
          stdout.write_all(line.as_bytes()).await?;
          stdout.write_all(b"\n").await?;
          stdout.flush().await?;
        }
        Err(e) => warn!(error = %e, "failed to encode host command"),
      }
    }
    Ok::<_, std::io::Error>(())
  });

  let mut worker = Worker::new(config, storage, command_tx, events.sender())?;
  worker.run(events).await?;
  drop(worker);

  match tokio::time::timeout(SHUTDOWN_GRACE, writer).await {
    Ok(Ok(result)) => result?,
    Ok(Err(e)) => warn!(error = %e, "output writer panicked"),
    Err(_) => warn!("responses still in flight at shutdown"),
  }
  Ok(())
}

/// A worker for one-shot commands. Host commands are collected and dropped.
fn detached_worker(
  config: Config,
  storage: Arc<SqliteStorage>,
) -> Result<(Worker, mpsc::UnboundedReceiver<HostCommand>)> {
  let (command_tx, command_rx) = mpsc::unbounded_channel();
  let (event_tx, _) = mpsc::unbounded_channel();
  let worker = Worker::new(config, storage, command_tx, event_tx)?;
  Ok((worker, command_rx))
}
