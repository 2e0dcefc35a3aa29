//! URL-pattern to strategy table.

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use std::time::Duration;
use url::Url;

use crate::config::{is_catch_all, Config, StrategyKind};

#[derive(Debug, Clone)]
pub struct Route {
  pub pattern: Regex,
  pub strategy: StrategyKind,
  pub partition: String,
  /// Deadline used when `strategy` is network-first
  pub timeout: Duration,
}

/// Ordered route table. First match wins; the last route always matches.
#[derive(Debug, Clone)]
pub struct Router {
  routes: Vec<Route>,
}

impl Router {
  pub fn from_config(config: &Config) -> Result<Self> {
    let routes = config
      .routes
      .iter()
      .map(|r| {
        Ok(Route {
          pattern: Regex::new(&r.pattern)
            .map_err(|e| eyre!("Invalid route pattern {:?}: {}", r.pattern, e))?,
          strategy: r.strategy,
          partition: r.partition.clone(),
          timeout: r
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.network_timeout()),
        })
      })
      .collect::<Result<Vec<_>>>()?;

    Self::new(routes)
  }

  pub fn new(routes: Vec<Route>) -> Result<Self> {
    match routes.last() {
      Some(last) if is_catch_all(last.pattern.as_str()) => Ok(Self { routes }),
      Some(last) => Err(eyre!(
        "The last route must be a catch-all, found {:?}",
        last.pattern.as_str()
      )),
      None => Err(eyre!("Route table is empty")),
    }
  }

  /// Pick the route for a URL.
  pub fn route(&self, url: &Url) -> &Route {
    let target = url.as_str();
    let last = self.routes.len() - 1;
    self
      .routes
      .iter()
      .find(|r| r.pattern.is_match(target))
      .unwrap_or(&self.routes[last])
  }

  pub fn partitions(&self) -> impl Iterator<Item = &str> {
    self.routes.iter().map(|r| r.partition.as_str())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn router() -> Router {
    Router::from_config(&Config::default()).unwrap()
  }

  fn partition_for(url: &str) -> (String, StrategyKind) {
    let router = router();
    let route = router.route(&Url::parse(url).unwrap());
    (route.partition.clone(), route.strategy)
  }

  #[test]
  fn test_fonts_are_cache_first() {
    assert_eq!(
      partition_for("https://fonts.googleapis.com/css2?family=Roboto"),
      ("fonts".to_string(), StrategyKind::CacheFirst)
    );
    assert_eq!(
      partition_for("https://brigade.example/fonts/inter.woff2"),
      ("fonts".to_string(), StrategyKind::CacheFirst)
    );
  }

  #[test]
  fn test_static_assets_are_stale_while_revalidate() {
    assert_eq!(
      partition_for("https://brigade.example/icons/truck.png"),
      ("images".to_string(), StrategyKind::StaleWhileRevalidate)
    );
    assert_eq!(
      partition_for("https://brigade.example/_next/static/app.js"),
      (
        "static-resources".to_string(),
        StrategyKind::StaleWhileRevalidate
      )
    );
  }

  #[test]
  fn test_first_match_wins() {
    assert_eq!(
      partition_for("https://brigade.example/api/checklists/7"),
      ("checklist-api".to_string(), StrategyKind::NetworkFirst)
    );
    assert_eq!(
      partition_for("https://brigade.example/api/fires?active=true"),
      ("fires-api".to_string(), StrategyKind::NetworkFirst)
    );
    assert_eq!(
      partition_for("https://brigade.example/api/settings"),
      ("api-responses".to_string(), StrategyKind::NetworkFirst)
    );
  }

  #[test]
  fn test_catch_all_takes_the_rest() {
    assert_eq!(
      partition_for("https://brigade.example/dashboard"),
      ("pages".to_string(), StrategyKind::NetworkFirst)
    );
  }

  #[test]
  fn test_route_timeout_defaults_to_config() {
    let router = router();
    let route = router.route(&Url::parse("https://brigade.example/").unwrap());
    assert_eq!(route.timeout, Duration::from_secs(10));
  }

  #[test]
  fn test_table_without_catch_all_rejected() {
    let routes = vec![Route {
      pattern: Regex::new("/api/").unwrap(),
      strategy: StrategyKind::NetworkFirst,
      partition: "api-responses".to_string(),
      timeout: Duration::from_secs(1),
    }];
    assert!(Router::new(routes).is_err());
    assert!(Router::new(Vec::new()).is_err());
  }

  #[test]
  fn test_catch_all_check_agrees_with_config() {
    let route = |pattern: &str| Route {
      pattern: Regex::new(pattern).unwrap(),
      strategy: StrategyKind::NetworkFirst,
      partition: "pages".to_string(),
      timeout: Duration::from_secs(1),
    };
    assert!(Router::new(vec![route("^.*$")]).is_ok());
    // Matches the empty string but is not one of the accepted catch-all forms
    assert!(Router::new(vec![route("(/api/)?.*")]).is_err());
  }
}
