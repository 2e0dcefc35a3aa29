use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "BRIGADE_OFFLINE_LOG";
const LOG_FILE_PREFIX: &str = "brigade-offline.log";

fn filter() -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber.
///
/// Stdout carries the host protocol, so logs go to a daily file under `log_dir`,
/// or to stderr when asked. Keep the returned guard alive to flush on exit.
pub fn init(log_dir: &Path, to_stderr: bool) -> Result<WorkerGuard> {
  let (writer, guard) = if to_stderr {
    tracing_appender::non_blocking(std::io::stderr())
  } else {
    std::fs::create_dir_all(log_dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    tracing_appender::non_blocking(appender)
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter())
    .with_writer(writer)
    .with_ansi(to_stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
