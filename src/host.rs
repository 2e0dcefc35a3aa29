//! JSON-lines protocol between the worker and its host.
//!
//! The host feeds lifecycle events in; the worker answers with commands. One JSON
//! object per line in both directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{CacheSource, StoredResponse};
use crate::error::{WorkerError, WorkerResult};

/// Lifecycle events delivered by the host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
  Install,
  Activate,
  Fetch {
    id: u64,
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    body: Option<String>,
  },
  Message {
    data: Value,
  },
  Sync {
    #[serde(default)]
    tag: Option<String>,
  },
  Push {
    #[serde(default)]
    data: Option<String>,
  },
  #[serde(rename = "notificationclick")]
  NotificationClick {
    #[serde(default)]
    url: Option<String>,
  },
  /// A newly activated worker took control of the page
  #[serde(rename = "controllerchange")]
  ControllerChange,
  Online,
  Offline,
  VersionWaiting {
    version: String,
  },
}

fn default_method() -> String {
  "GET".to_string()
}

impl HostEvent {
  /// Parse one protocol line.
  pub fn parse(line: &str) -> WorkerResult<Self> {
    serde_json::from_str(line).map_err(|e| WorkerError::MalformedMessage(e.to_string()))
  }

  /// Event name used in acknowledgments.
  pub fn name(&self) -> &'static str {
    match self {
      HostEvent::Install => "install",
      HostEvent::Activate => "activate",
      HostEvent::Fetch { .. } => "fetch",
      HostEvent::Message { .. } => "message",
      HostEvent::Sync { .. } => "sync",
      HostEvent::Push { .. } => "push",
      HostEvent::NotificationClick { .. } => "notificationclick",
      HostEvent::ControllerChange => "controllerchange",
      HostEvent::Online => "online",
      HostEvent::Offline => "offline",
      HostEvent::VersionWaiting { .. } => "version_waiting",
    }
  }
}

/// Response body on the wire: text when it is UTF-8, hex otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WireBody {
  Text(String),
  Hex(String),
}

impl From<&[u8]> for WireBody {
  fn from(bytes: &[u8]) -> Self {
    match std::str::from_utf8(bytes) {
      Ok(text) => WireBody::Text(text.to_string()),
      Err(_) => WireBody::Hex(hex::encode(bytes)),
    }
  }
}

/// Commands the worker sends to its host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HostCommand {
  Respond {
    id: u64,
    status: u16,
    headers: Vec<(String, String)>,
    body: WireBody,
    /// None when the response was synthesized by the worker
    source: Option<CacheSource>,
  },
  /// The async work for an event finished
  Ack {
    event: String,
  },
  UpdateAvailable {
    version: String,
  },
  SkipWaiting,
  Reload,
  ShowNotification {
    title: String,
    body: String,
    url: String,
  },
  OpenWindow {
    url: String,
  },
  SyncFailed {
    id: i64,
    url: String,
    retries: u32,
    error: String,
  },
  SyncCompleted {
    delivered: usize,
  },
  ScheduleSync {
    after_secs: u64,
  },
}

impl HostCommand {
  pub fn respond(id: u64, response: &StoredResponse, source: Option<CacheSource>) -> Self {
    HostCommand::Respond {
      id,
      status: response.status,
      headers: response.headers.clone(),
      body: WireBody::from(response.body.as_slice()),
      source,
    }
  }

  pub fn ack(event: &str) -> Self {
    HostCommand::Ack {
      event: event.to_string(),
    }
  }

  pub fn to_line(&self) -> WorkerResult<String> {
    serde_json::to_string(self).map_err(|e| WorkerError::MalformedMessage(e.to_string()))
  }
}
