//! Push payload parsing and notification clicks.

use serde::Deserialize;
use tracing::warn;

use crate::config::PushConfig;
use crate::error::WorkerError;
use crate::host::HostCommand;

#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  message: Option<String>,
  url: Option<String>,
}

/// Build the notification for a push event. Missing or malformed data uses defaults.
pub fn notification(data: Option<&str>, defaults: &PushConfig) -> HostCommand {
  let payload = match data.map(serde_json::from_str::<PushPayload>) {
    Some(Ok(payload)) => payload,
    Some(Err(e)) => {
      let err = WorkerError::MalformedMessage(e.to_string());
      warn!(error = %err, "push payload ignored");
      PushPayload::default()
    }
    None => PushPayload::default(),
  };

  HostCommand::ShowNotification {
    title: payload
      .title
      .unwrap_or_else(|| defaults.default_title.clone()),
    body: payload
      .message
      .unwrap_or_else(|| defaults.default_message.clone()),
    url: payload.url.unwrap_or_else(|| defaults.default_url.clone()),
  }
}

/// Window to open when a notification is clicked.
pub fn click_target(url: Option<&str>) -> HostCommand {
  HostCommand::OpenWindow {
    url: url.filter(|u| !u.is_empty()).unwrap_or("/").to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_full_payload() {
    let command = notification(
      Some(r#"{"title":"Wildfire alert","message":"New fire near Sector 4","url":"/fires/12"}"#),
      &PushConfig::default(),
    );
    assert_eq!(
      command,
      HostCommand::ShowNotification {
        title: "Wildfire alert".to_string(),
        body: "New fire near Sector 4".to_string(),
        url: "/fires/12".to_string(),
      }
    );
  }

  #[test]
  fn test_partial_payload_uses_defaults() {
    let defaults = PushConfig::default();
    let command = notification(Some(r#"{"message":"Checklist overdue"}"#), &defaults);
    assert_eq!(
      command,
      HostCommand::ShowNotification {
        title: defaults.default_title.clone(),
        body: "Checklist overdue".to_string(),
        url: "/".to_string(),
      }
    );
  }

  #[test]
  fn test_malformed_payload_falls_back() {
    let defaults = PushConfig::default();
    let command = notification(Some("plain text, not json"), &defaults);
    assert_eq!(
      command,
      HostCommand::ShowNotification {
        title: defaults.default_title.clone(),
        body: defaults.default_message.clone(),
        url: defaults.default_url.clone(),
      }
    );
  }

  #[test]
  fn test_click_target() {
    assert_eq!(
      click_target(Some("/fires/12")),
      HostCommand::OpenWindow {
        url: "/fires/12".to_string()
      }
    );
    assert_eq!(
      click_target(None),
      HostCommand::OpenWindow {
        url: "/".to_string()
      }
    );
  }
}
