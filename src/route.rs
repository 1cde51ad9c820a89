//! Route classification: map a request to a (tier, strategy, options) route.
//!
//! Classification is pure and does no I/O. Pattern groups are matched in a
//! fixed precedence order; within the API group the longest registered
//! endpoint prefix owns the request.

use std::time::Duration;

use crate::config::{EndpointPolicy, RoutingConfig};
use crate::http::RequestDescriptor;
use crate::strategy::Strategy;
use crate::tier::TierKind;

/// Where a classified request is served from and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
  pub tier: TierKind,
  pub strategy: Strategy,
  /// Bound on the network leg, for strategies that race it.
  pub timeout: Option<Duration>,
  /// Freshness window for cached entries.
  pub max_age: Option<Duration>,
}

impl Route {
  fn new(tier: TierKind, strategy: Strategy) -> Self {
    Self {
      tier,
      strategy,
      timeout: None,
      max_age: None,
    }
  }
}

/// Pure classifier over injected pattern groups and endpoint policies.
pub struct RouteClassifier {
  routing: RoutingConfig,
  endpoints: Vec<EndpointPolicy>,
}

impl RouteClassifier {
  pub fn new(routing: RoutingConfig, endpoints: Vec<EndpointPolicy>) -> Self {
    Self { routing, endpoints }
  }

  /// Classify a request. `None` means the request is not intercepted:
  /// non-GET requests always pass straight to the network.
  pub fn classify(&self, request: &RequestDescriptor) -> Option<Route> {
    if !request.method.is_get() {
      return None;
    }

    let path = request.url.path();

    // Real-time paths outrank every other group.
    if self.matches_marker(&self.routing.realtime_paths, path) {
      return Some(Route::new(TierKind::Realtime, Strategy::NetworkOnly));
    }

    // Specialized binary assets, by marker or extension.
    if self.matches_marker(&self.routing.asset_paths, path)
      || self.has_extension(path, &self.routing.asset_extensions)
    {
      return Some(Route::new(TierKind::Asset, Strategy::CacheFirst));
    }

    if path.starts_with(&self.routing.api_prefix) {
      return Some(self.api_route(path));
    }

    if path.starts_with(&self.routing.model_prefix) {
      return Some(Route::new(TierKind::Model, Strategy::CacheFirst));
    }

    // Generic static files: known extensions or configured CDN hosts.
    if self.has_extension(path, &self.routing.static_extensions) || self.is_cdn(request) {
      return Some(Route::new(TierKind::Media, Strategy::CacheFirst));
    }

    // Navigations get network-first with the renderable fallback chain.
    if request.navigate || request.accepts_html() {
      return Some(Route::new(TierKind::Static, Strategy::NetworkFirst));
    }

    Some(Route::new(TierKind::Static, self.routing.default_strategy))
  }

  /// API routes: longest matching endpoint prefix wins; no match falls back
  /// to network-first.
  fn api_route(&self, path: &str) -> Route {
    let policy = self
      .endpoints
      .iter()
      .filter(|p| path.starts_with(&p.prefix))
      .max_by_key(|p| p.prefix.len());

    match policy {
      Some(policy) => Route {
        tier: TierKind::Api,
        strategy: policy.strategy,
        timeout: policy.timeout_ms.map(Duration::from_millis),
        max_age: policy.max_age_seconds.map(Duration::from_secs),
      },
      None => Route::new(TierKind::Api, Strategy::NetworkFirst),
    }
  }

  fn matches_marker(&self, markers: &[String], path: &str) -> bool {
    markers.iter().any(|marker| path.contains(marker.as_str()))
  }

  fn has_extension(&self, path: &str, extensions: &[String]) -> bool {
    match extension(path) {
      Some(ext) => extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
      None => false,
    }
  }

  fn is_cdn(&self, request: &RequestDescriptor) -> bool {
    match request.url.host_str() {
      Some(host) => self.routing.cdn_hosts.iter().any(|h| h == host),
      None => false,
    }
  }
}

/// Extension of the final path segment, if any.
fn extension(path: &str) -> Option<&str> {
  let segment = path.rsplit('/').next()?;
  let (_, ext) = segment.rsplit_once('.')?;
  if ext.is_empty() {
    None
  } else {
    Some(ext)
  }
}
