use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::host::HostEvent;

/// Worker events
#[derive(Debug)]
pub enum Event {
  /// Lifecycle event from the host
  Host(HostEvent),
  /// Periodic preload tick
  Tick,
  /// A delayed sync retry came due
  SyncDue,
  /// Host sent a line that isn't a valid event
  Malformed(String),
  /// Host input closed
  Shutdown,
}

/// Event handler that produces events from host input and a tick timer
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler reading host events from stdin
  pub fn new(tick_rate: Duration) -> Self {
    let handler = Self::with_reader(BufReader::new(tokio::io::stdin()));
    handler.spawn_ticker(tick_rate);
    handler
  }

  /// Create an event handler reading host events from any line source
  pub fn with_reader<R>(reader: R) -> Self
  where
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    let input_tx = tx.clone();
    tokio::spawn(async move {
      let mut lines = reader.split(b'\n');
      loop {
        let event = match lines.next_segment().await {
          Ok(Some(raw)) => match String::from_utf8(raw) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => match HostEvent::parse(&line) {
              Ok(event) => Event::Host(event),
              Err(e) => Event::Malformed(e.to_string()),
            },
            Err(e) => Event::Malformed(format!("line is not UTF-8: {}", e)),
          },
          Ok(None) => Event::Shutdown,
          Err(e) => {
            warn!(error = %e, "failed to read host input");
            Event::Shutdown
          }
        };
        let done = matches!(event, Event::Shutdown);
        if input_tx.send(event).is_err() || done {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  fn spawn_ticker(&self, tick_rate: Duration) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      // The first tick completes immediately; skip it so startup isn't a preload
      interval.tick().await;
      loop {
        interval.tick().await;
        if tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });
  }

  /// Sender for scheduling events from inside the worker
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
