//! Messages posted from the UI to the worker.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{WorkerError, WorkerResult};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Activate the waiting worker now
  SkipWaiting,
  AcceptUpdate,
  DismissUpdate,
  UpdateResourcePriority { url: String, priority: f64 },
}

const KNOWN_TYPES: &[&str] = &[
  "SKIP_WAITING",
  "ACCEPT_UPDATE",
  "DISMISS_UPDATE",
  "UPDATE_RESOURCE_PRIORITY",
];

impl ClientMessage {
  /// Parse a message payload.
  ///
  /// Returns `Ok(None)` for well-formed messages of a type this worker doesn't handle,
  /// and `MalformedMessage` when the payload has no type or a known type with bad fields.
  pub fn parse(data: &Value) -> WorkerResult<Option<Self>> {
    let kind = data
      .get("type")
      .and_then(Value::as_str)
      .ok_or_else(|| WorkerError::MalformedMessage(format!("message without type: {}", data)))?;

    if !KNOWN_TYPES.contains(&kind) {
      return Ok(None);
    }

    serde_json::from_value(data.clone())
      .map(Some)
      .map_err(|e| WorkerError::MalformedMessage(format!("{}: {}", kind, e)))
  }
}
