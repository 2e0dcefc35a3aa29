//! New-version detection and the update prompt state machine.

use tracing::{debug, info};

use crate::host::HostCommand;

/// `Idle -> UpdateAvailable -> (Accepted -> Reloading) | (dismissed -> Idle)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateState {
  Idle,
  UpdateAvailable { version: String },
  Accepted { version: String },
  Reloading { version: String },
}

pub struct UpdateNotifier {
  current_version: String,
  state: UpdateState,
}

impl UpdateNotifier {
  pub fn new(current_version: impl Into<String>) -> Self {
    Self {
      current_version: current_version.into(),
      state: UpdateState::Idle,
    }
  }

  #[cfg(test)]
  pub fn state(&self) -> &UpdateState {
    &self.state
  }

  /// A worker version is installed and waiting to activate.
  ///
  /// Only an idle notifier reacts, and only to a version other than its own.
  pub fn detect(&mut self, waiting_version: &str) -> Option<HostCommand> {
    if waiting_version == self.current_version {
      debug!(version = waiting_version, "waiting worker is the running version");
      return None;
    }
    if self.state != UpdateState::Idle {
      debug!(version = waiting_version, state = ?self.state, "update already in progress");
      return None;
    }

    info!(
      current = %self.current_version,
      waiting = waiting_version,
      "update available"
    );
    self.state = UpdateState::UpdateAvailable {
      version: waiting_version.to_string(),
    };
    Some(HostCommand::UpdateAvailable {
      version: waiting_version.to_string(),
    })
  }

  /// The user accepted the update: tell the waiting worker to skip waiting.
  ///
  /// The reload follows once the new worker has taken control.
  pub fn accept(&mut self) -> Option<HostCommand> {
    let UpdateState::UpdateAvailable { version } = &self.state else {
      debug!(state = ?self.state, "accept ignored, no update pending");
      return None;
    };

    info!(version = %version, "update accepted, activating waiting worker");
    self.state = UpdateState::Accepted {
      version: version.clone(),
    };
    Some(HostCommand::SkipWaiting)
  }

  /// The accepted worker now controls the page. Reloads exactly once.
  pub fn controller_changed(&mut self) -> Option<HostCommand> {
    let UpdateState::Accepted { version } = &self.state else {
      debug!(state = ?self.state, "controller change without accepted update");
      return None;
    };

    info!(version = %version, "reloading into new version");
    self.state = UpdateState::Reloading {
      version: version.clone(),
    };
    Some(HostCommand::Reload)
  }

  /// The user dismissed the prompt. It comes back on the next detection.
  pub fn dismiss(&mut self) -> bool {
    if matches!(self.state, UpdateState::UpdateAvailable { .. }) {
      self.state = UpdateState::Idle;
      return true;
    }
    false
  }
}
