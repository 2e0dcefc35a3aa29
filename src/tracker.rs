//! Per-resource usage tracking for preload priorities.
//!
//! State lives only as long as the worker process; a restart starts from nothing.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::config::TrackerConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
  /// Number of observed fetches, never decreases
  pub frequency: u64,
  pub last_used: DateTime<Utc>,
  /// Score set explicitly by the UI; wins over the computed one
  pub priority_override: Option<f64>,
}

pub struct UsageTracker {
  records: HashMap<String, UsageRecord>,
  max_tracked: usize,
  half_life_secs: f64,
  frequency_weight: f64,
}

impl UsageTracker {
  pub fn new(config: &TrackerConfig) -> Self {
    Self {
      records: HashMap::new(),
      max_tracked: config.max_tracked.max(1),
      half_life_secs: config.recency_half_life_secs.max(1) as f64,
      frequency_weight: config.frequency_weight.clamp(0.0, 1.0),
    }
  }

  pub fn record_access(&mut self, url: &str) {
    self.record_access_at(url, Utc::now());
  }

  pub fn record_access_at(&mut self, url: &str, now: DateTime<Utc>) {
    if let Some(record) = self.records.get_mut(url) {
      record.frequency += 1;
      record.last_used = now;
      return;
    }
    self.insert(
      url,
      UsageRecord {
        frequency: 1,
        last_used: now,
        priority_override: None,
      },
    );
  }

  /// Pin the priority of a resource, clamped to [0, 1].
  pub fn update_priority(&mut self, url: &str, score: f64) {
    let score = if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) };
    if let Some(record) = self.records.get_mut(url) {
      record.priority_override = Some(score);
      return;
    }
    self.insert(
      url,
      UsageRecord {
        frequency: 0,
        last_used: Utc::now(),
        priority_override: Some(score),
      },
    );
  }

  #[cfg(test)]
  pub fn priority(&self, url: &str) -> f64 {
    self.priority_at(url, Utc::now())
  }

  /// Weighted mix of a frequency score and an exponentially decaying recency score.
  #[cfg(test)]
  pub fn priority_at(&self, url: &str, now: DateTime<Utc>) -> f64 {
    match self.records.get(url) {
      Some(record) => self.score(record, now),
      None => 0.0,
    }
  }

  fn score(&self, record: &UsageRecord, now: DateTime<Utc>) -> f64 {
    if let Some(pinned) = record.priority_override {
      return pinned;
    }
    let frequency = record.frequency as f64;
    let frequency_score = frequency / (frequency + 1.0);

    let age_secs = (now - record.last_used).num_milliseconds().max(0) as f64 / 1000.0;
    let recency_score = 0.5f64.powf(age_secs / self.half_life_secs);

    let score =
      self.frequency_weight * frequency_score + (1.0 - self.frequency_weight) * recency_score;
    score.clamp(0.0, 1.0)
  }

  /// Resources scoring at least `min_priority`, highest first.
  pub fn candidates(&self, min_priority: f64, now: DateTime<Utc>) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = self
      .records
      .iter()
      .map(|(url, record)| (url.clone(), self.score(record, now)))
      .filter(|(_, score)| *score >= min_priority)
      .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
  }

  #[cfg(test)]
  pub fn record(&self, url: &str) -> Option<&UsageRecord> {
    self.records.get(url)
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.records.len()
  }

  fn insert(&mut self, url: &str, record: UsageRecord) {
    if self.records.len() >= self.max_tracked {
      let oldest = self
        .records
        .iter()
        .min_by_key(|(_, r)| r.last_used)
        .map(|(url, _)| url.clone());
      if let Some(oldest) = oldest {
        self.records.remove(&oldest);
      }
    }
    self.records.insert(url.to_string(), record);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn tracker() -> UsageTracker {
    UsageTracker::new(&TrackerConfig::default())
  }

  #[test]
  fn test_unknown_resource_scores_zero() {
    assert_eq!(tracker().priority("/nope.js"), 0.0);
  }

  #[test]
  fn test_priority_grows_with_frequency() {
    let mut tracker = tracker();
    let now = Utc::now();
    let mut previous = 0.0;
    for _ in 0..20 {
      tracker.record_access_at("/app.js", now);
      let score = tracker.priority_at("/app.js", now);
      assert!(score >= previous);
      assert!((0.0..=1.0).contains(&score));
      previous = score;
    }
    assert_eq!(tracker.record("/app.js").unwrap().frequency, 20);
  }

  #[test]
  fn test_priority_decays_with_age() {
    let mut tracker = tracker();
    let used = Utc::now();
    tracker.record_access_at("/app.js", used);

    let fresh = tracker.priority_at("/app.js", used);
    let hour = tracker.priority_at("/app.js", used + Duration::hours(1));
    let day = tracker.priority_at("/app.js", used + Duration::days(1));
    assert!(fresh > hour);
    assert!(hour > day);
  }

  #[test]
  fn test_override_wins_and_is_clamped() {
    let mut tracker = tracker();
    tracker.update_priority("/test-resource.js", 0.9);
    assert_eq!(tracker.priority("/test-resource.js"), 0.9);

    tracker.record_access("/test-resource.js");
    assert_eq!(tracker.priority("/test-resource.js"), 0.9);

    tracker.update_priority("/test-resource.js", 4.0);
    assert_eq!(tracker.priority("/test-resource.js"), 1.0);
    tracker.update_priority("/test-resource.js", f64::NAN);
    assert_eq!(tracker.priority("/test-resource.js"), 0.0);
  }

  #[test]
  fn test_candidates_sorted_and_filtered() {
    let mut tracker = tracker();
    let now = Utc::now();
    tracker.update_priority("/low.js", 0.2);
    tracker.update_priority("/high.js", 0.95);
    tracker.update_priority("/mid.js", 0.85);

    let urls: Vec<String> = tracker
      .candidates(0.8, now)
      .into_iter()
      .map(|(url, _)| url)
      .collect();
    assert_eq!(urls, vec!["/high.js", "/mid.js"]);
  }

  #[test]
  fn test_cap_drops_least_recently_used() {
    let mut tracker = UsageTracker::new(&TrackerConfig {
      max_tracked: 2,
      ..TrackerConfig::default()
    });
    let now = Utc::now();
    tracker.record_access_at("/a", now - Duration::minutes(10));
    tracker.record_access_at("/b", now - Duration::minutes(5));
    tracker.record_access_at("/c", now);

    assert_eq!(tracker.len(), 2);
    assert!(tracker.record("/a").is_none());
    assert!(tracker.record("/c").is_some());
  }
}
