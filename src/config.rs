use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Worker configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL that relative request paths resolve against
  pub origin: String,
  /// Version string of this worker build
  pub version: String,
  /// Deadline for network-first fetches
  pub network_timeout_secs: u64,
  /// URLs fetched at install, each into the partition its route selects
  pub precache: Vec<String>,
  /// Ordered route table, first match wins
  pub routes: Vec<RouteConfig>,
  /// Expiration policy per cache partition
  pub partitions: BTreeMap<String, PartitionConfig>,
  pub preload: PreloadConfig,
  pub tracker: TrackerConfig,
  pub sync: SyncConfig,
  pub push: PushConfig,
  /// Cache database location (default: $XDG_DATA_HOME/brigade-offline/cache.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
  /// Regex matched against the absolute request URL
  pub pattern: String,
  pub strategy: StrategyKind,
  pub partition: String,
  /// Overrides `network_timeout_secs` for network-first routes
  #[serde(default)]
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PartitionConfig {
  pub max_entries: usize,
  pub max_age_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
  pub min_priority: f64,
  pub max_concurrent: usize,
  /// Time budget of a single tick; unfinished fetches are cancelled
  pub window_secs: u64,
  pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
  /// Cap on tracked resources; least recently used records are dropped beyond it
  pub max_tracked: usize,
  pub recency_half_life_secs: u64,
  /// Share of the score given to frequency, the remainder goes to recency
  pub frequency_weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_retries: u32,
  pub base_backoff_secs: u64,
  pub max_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
  pub default_title: String,
  pub default_message: String,
  pub default_url: String,
}

const DAY: u64 = 24 * 60 * 60;

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      version: env!("CARGO_PKG_VERSION").to_string(),
      network_timeout_secs: 10,
      precache: vec!["/".to_string(), "/offline".to_string()],
      routes: default_routes(),
      partitions: default_partitions(),
      preload: PreloadConfig::default(),
      tracker: TrackerConfig::default(),
      sync: SyncConfig::default(),
      push: PushConfig::default(),
      database: None,
    }
  }
}

impl Default for PreloadConfig {
  fn default() -> Self {
    Self {
      min_priority: 0.8,
      max_concurrent: 3,
      window_secs: 30,
      interval_secs: 300,
    }
  }
}

impl Default for TrackerConfig {
  fn default() -> Self {
    Self {
      max_tracked: 500,
      recency_half_life_secs: 3600,
      frequency_weight: 0.5,
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 5,
      base_backoff_secs: 5,
      max_backoff_secs: 300,
    }
  }
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      default_title: "Brigade".to_string(),
      default_message: "New update from your brigade".to_string(),
      default_url: "/".to_string(),
    }
  }
}

fn route(pattern: &str, strategy: StrategyKind, partition: &str) -> RouteConfig {
  RouteConfig {
    pattern: pattern.to_string(),
    strategy,
    partition: partition.to_string(),
    timeout_secs: None,
  }
}

fn default_routes() -> Vec<RouteConfig> {
  use StrategyKind::*;
  vec![
    route(r"^https://fonts\.(?:googleapis|gstatic)\.com/", CacheFirst, "fonts"),
    route(r"\.(?:woff2?|ttf|otf|eot)$", CacheFirst, "fonts"),
    route(r"\.(?:png|jpe?g|gif|svg|webp|ico|avif)$", StaleWhileRevalidate, "images"),
    route(r"\.(?:js|css)$", StaleWhileRevalidate, "static-resources"),
    route(r"/api/checklists", NetworkFirst, "checklist-api"),
    route(r"/api/fires", NetworkFirst, "fires-api"),
    route(r"/api/", NetworkFirst, "api-responses"),
    route(r".*", NetworkFirst, "pages"),
  ]
}

fn default_partitions() -> BTreeMap<String, PartitionConfig> {
  let policy = |max_entries, max_age_seconds| PartitionConfig {
    max_entries,
    max_age_seconds,
  };
  BTreeMap::from([
    ("fonts".to_string(), policy(30, 365 * DAY)),
    ("images".to_string(), policy(64, 30 * DAY)),
    ("static-resources".to_string(), policy(64, DAY)),
    ("checklist-api".to_string(), policy(100, DAY)),
    ("fires-api".to_string(), policy(50, 60 * 60)),
    ("api-responses".to_string(), policy(50, DAY)),
    ("pages".to_string(), policy(50, DAY)),
  ])
}

impl Config {
  /// Load configuration from file, falling back to built-in defaults.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./brigade-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/brigade-offline/config.yaml
  ///
  /// `BRIGADE_OFFLINE_ORIGIN` overrides `origin` in every case.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(origin) = std::env::var("BRIGADE_OFFLINE_ORIGIN") {
      config.origin = origin;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("brigade-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("brigade-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    // An empty document deserializes to unit, not to an empty mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Check cross-field invariants that serde can't express.
  pub fn validate(&self) -> Result<()> {
    url::Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))?;

    let last = self
      .routes
      .last()
      .ok_or_else(|| eyre!("Route table is empty; a catch-all route is required"))?;
    if !is_catch_all(&last.pattern) {
      return Err(eyre!(
        "The last route must be a catch-all (\".*\"), found {:?}",
        last.pattern
      ));
    }
    if let Some(early) = self.routes[..self.routes.len() - 1]
      .iter()
      .find(|r| is_catch_all(&r.pattern))
    {
      return Err(eyre!(
        "Catch-all route for partition {} shadows the routes after it",
        early.partition
      ));
    }

    for route in &self.routes {
      regex::Regex::new(&route.pattern)
        .map_err(|e| eyre!("Invalid route pattern {:?}: {}", route.pattern, e))?;
      if !self.partitions.contains_key(&route.partition) {
        return Err(eyre!(
          "Route {:?} uses partition {} which has no expiration policy",
          route.pattern,
          route.partition
        ));
      }
    }

    if self.preload.max_concurrent == 0 {
      return Err(eyre!("preload.max_concurrent must be at least 1"));
    }
    if !(0.0..=1.0).contains(&self.preload.min_priority) {
      return Err(eyre!(
        "preload.min_priority must be within [0, 1], got {}",
        self.preload.min_priority
      ));
    }

    Ok(())
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }

  /// Get the cache database path.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }
    let data_dir = data_dir()?;
    Ok(data_dir.join("cache.db"))
  }
}

/// Directory holding the database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("brigade-offline"))
}

/// Whether a route pattern matches every URL.
pub(crate) fn is_catch_all(pattern: &str) -> bool {
  matches!(pattern, ".*" | "^.*$" | "^.*" | ".*$")
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.routes.last().map(|r| r.pattern.as_str()), Some(".*"));
  }

  #[test]
  fn test_empty_yaml_uses_defaults() {
    let config = Config::from_yaml("").unwrap();
    assert_eq!(config.network_timeout_secs, 10);
    assert_eq!(config.preload.max_concurrent, 3);
  }

  #[test]
  fn test_partial_yaml_keeps_other_defaults() {
    let config = Config::from_yaml("origin: https://brigade.example\npreload:\n  min_priority: 0.5\n")
      .unwrap();
    assert_eq!(config.origin, "https://brigade.example");
    assert_eq!(config.preload.min_priority, 0.5);
    assert_eq!(config.preload.max_concurrent, 3);
    assert_eq!(config.sync.max_retries, 5);
  }

  #[test]
  fn test_catch_all_must_be_last() {
    let yaml = r#"
routes:
  - pattern: ".*"
    strategy: network-first
    partition: pages
  - pattern: "/api/"
    strategy: network-first
    partition: api-responses
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_catch_all_rejected() {
    let yaml = r#"
routes:
  - pattern: "/api/"
    strategy: network-first
    partition: api-responses
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("catch-all"));
  }

  #[test]
  fn test_unknown_partition_rejected() {
    let yaml = r#"
routes:
  - pattern: ".*"
    strategy: cache-first
    partition: nowhere
"#;
    let config = Config::from_yaml(yaml).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("nowhere"));
  }

  #[test]
  fn test_load_from_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "version: \"2.1.0\"\nnetwork_timeout_secs: 3").unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.version, "2.1.0");
    assert_eq!(config.network_timeout(), Duration::from_secs(3));
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let err = Config::load(Some(Path::new("/nonexistent/brigade.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
