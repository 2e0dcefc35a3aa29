//! UI-facing signals: update prompts, background sync of offline mutations and
//! push notifications.

pub mod push;
mod sync;
mod update;

pub use sync::{DrainReport, SyncQueue};
pub use update::UpdateNotifier;
#[cfg(test)]
pub use update::UpdateState;
