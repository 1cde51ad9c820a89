//! Caching strategies and the executor that runs them.
//!
//! Every classified request resolves to exactly one response here. Network
//! and cache failures are recovered locally and converted into cached
//! fallbacks or synthesized responses; nothing escapes as an error.
//!
//! Background work (revalidation, stale-while-revalidate updates) runs as
//! detached tasks whose completion or failure is observable only through
//! later cache reads, never through the original caller's response.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Config;
use crate::http::{canonical_key, RequestDescriptor, ResponseSnapshot};
use crate::net::Fetcher;
use crate::route::Route;
use crate::tier::{TierKind, TierStore};
use url::Url;

/// The algorithm governing how a request is satisfied from cache vs. network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  NetworkFirst,
  CacheFirst,
  StaleWhileRevalidate,
  NetworkOnly,
  CacheOnly,
}

/// Runs the selected strategy for a classified request.
pub struct StrategyExecutor {
  store: Arc<dyn TierStore>,
  fetcher: Arc<dyn Fetcher>,
  version: String,
  origin: Url,
  offline_path: String,
  network_only_cacheable: Vec<String>,
  default_timeout: Duration,
}

impl StrategyExecutor {
  pub fn new(store: Arc<dyn TierStore>, fetcher: Arc<dyn Fetcher>, config: &Config) -> Self {
    Self {
      store,
      fetcher,
      version: config.version.clone(),
      origin: config.origin.clone(),
      offline_path: config.offline_path.clone(),
      network_only_cacheable: config.routing.network_only_cacheable.clone(),
      default_timeout: config.default_timeout(),
    }
  }

  /// Execute the route's strategy. Always returns a response.
  pub async fn execute(&self, request: &RequestDescriptor, route: &Route) -> ResponseSnapshot {
    let tier = route.tier.versioned(&self.version);

    match route.strategy {
      Strategy::NetworkFirst => self.network_first(request, route, &tier).await,
      Strategy::CacheFirst => self.cache_first(request, route, &tier).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, route, &tier).await,
      Strategy::NetworkOnly => self.network_only(request, route, &tier).await,
      Strategy::CacheOnly => self.cache_only(request, route, &tier).await,
    }
  }

  /// Race the network against the route's timeout; fall back to cache, then
  /// to the tier's offline response. A timed-out fetch is dropped before its
  /// result could reach the cache, so the caller never observes a response
  /// that was stored behind its back.
  async fn network_first(
    &self,
    request: &RequestDescriptor,
    route: &Route,
    tier: &str,
  ) -> ResponseSnapshot {
    let limit = route.timeout.unwrap_or(self.default_timeout);

    match timeout(limit, self.fetcher.fetch(request)).await {
      Ok(Ok(response)) if response.is_success() => {
        self.store_entry(tier, &request.cache_key(), &response);
        return response;
      }
      Ok(Ok(response)) => {
        debug!(key = %request.cache_key(), status = response.status, "network-first got non-success");
      }
      Ok(Err(e)) => {
        debug!(key = %request.cache_key(), error = %e, "network-first fetch failed");
      }
      Err(_) => {
        debug!(key = %request.cache_key(), timeout_ms = limit.as_millis() as u64, "network-first timed out");
      }
    }

    if let Some(cached) = self.cached(tier, &request.cache_key()) {
      return cached;
    }
    self.fallback(request, route.tier)
  }

  /// Serve from cache when possible, revalidating in the background. A
  /// stale entry (older than the route's max-age) flips the preference to
  /// the network, keeping the stale copy as the offline fallback.
  async fn cache_first(
    &self,
    request: &RequestDescriptor,
    route: &Route,
    tier: &str,
  ) -> ResponseSnapshot {
    let key = request.cache_key();

    if let Some(cached) = self.cached(tier, &key) {
      let fresh = match route.max_age {
        Some(window) => {
          cached.age() <= chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX)
        }
        None => true,
      };

      if fresh {
        self.spawn_revalidate(request, tier);
        return cached;
      }

      return match self.fetcher.fetch(request).await {
        Ok(response) if response.is_success() => {
          self.store_entry(tier, &key, &response);
          response
        }
        // Stale beats nothing when the network is out.
        _ => cached,
      };
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store_entry(tier, &key, &response);
        }
        response
      }
      Err(e) => {
        debug!(key = %key, error = %e, "cache-first miss and fetch failed");
        self.fallback(request, route.tier)
      }
    }
  }

  /// Return the cached entry immediately while the network leg, started
  /// first, refreshes the cache in the background. Without a cached entry
  /// the network result is awaited directly.
  async fn stale_while_revalidate(
    &self,
    request: &RequestDescriptor,
    route: &Route,
    tier: &str,
  ) -> ResponseSnapshot {
    let key = request.cache_key();

    let store = Arc::clone(&self.store);
    let fetcher = Arc::clone(&self.fetcher);
    let bg_request = request.clone();
    let bg_tier = tier.to_string();
    let revalidation = tokio::spawn(async move {
      let response = fetcher.fetch(&bg_request).await?;
      if response.is_success() {
        if let Err(e) = store.put(&bg_tier, &bg_request.cache_key(), &response) {
          warn!(tier = %bg_tier, error = %e, "revalidation write failed");
        }
      }
      Ok::<_, crate::error::EngineError>(response)
    });

    if let Some(cached) = self.cached(tier, &key) {
      // The revalidation task keeps running after we return.
      return cached;
    }

    match revalidation.await {
      Ok(Ok(response)) => response,
      Ok(Err(e)) => {
        debug!(key = %key, error = %e, "stale-while-revalidate fetch failed");
        self.fallback(request, route.tier)
      }
      Err(e) => {
        debug!(key = %key, error = %e, "stale-while-revalidate task aborted");
        self.fallback(request, route.tier)
      }
    }
  }

  /// Straight to the network, except for an allow-list of cacheable
  /// sub-resources (model metadata files) that keep cache-first semantics.
  /// Offline callers still receive a structured result.
  async fn network_only(
    &self,
    request: &RequestDescriptor,
    route: &Route,
    tier: &str,
  ) -> ResponseSnapshot {
    let path = request.url.path();
    if self
      .network_only_cacheable
      .iter()
      .any(|suffix| path.ends_with(suffix.as_str()))
    {
      return self.cache_first(request, route, tier).await;
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        debug!(key = %request.cache_key(), error = %e, "network-only fetch failed");
        if let Some(cached) = self.cached(tier, &request.cache_key()) {
          return cached;
        }
        ResponseSnapshot::simulated_offline()
      }
    }
  }

  /// Never contacts the network.
  async fn cache_only(
    &self,
    request: &RequestDescriptor,
    route: &Route,
    tier: &str,
  ) -> ResponseSnapshot {
    match self.cached(tier, &request.cache_key()) {
      Some(cached) => cached,
      None => self.fallback(request, route.tier),
    }
  }

  /// Refresh one cache entry without blocking the response already served.
  /// Detached; failures are swallowed.
  fn spawn_revalidate(&self, request: &RequestDescriptor, tier: &str) {
    let store = Arc::clone(&self.store);
    let fetcher = Arc::clone(&self.fetcher);
    let request = request.clone();
    let tier = tier.to_string();

    tokio::spawn(async move {
      match fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => {
          if let Err(e) = store.put(&tier, &request.cache_key(), &response) {
            warn!(tier = %tier, key = %request.cache_key(), error = %e, "revalidation write failed");
          }
        }
        Ok(_) => {}
        Err(e) => {
          debug!(key = %request.cache_key(), error = %e, "revalidation fetch failed");
        }
      }
    });
  }

  /// Cache read with storage failures demoted to a miss.
  fn cached(&self, tier: &str, key: &str) -> Option<ResponseSnapshot> {
    match self.store.get(tier, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(tier, key, error = %e, "cache read failed");
        None
      }
    }
  }

  /// Best-effort cache write; a failed write must not fail the response.
  fn store_entry(&self, tier: &str, key: &str, response: &ResponseSnapshot) {
    if let Err(e) = self.store.put(tier, key, response) {
      warn!(tier, key, error = %e, "cache write failed");
    }
  }

  /// Terminal response when both cache and network are out, per tier.
  fn fallback(&self, request: &RequestDescriptor, tier: TierKind) -> ResponseSnapshot {
    match tier {
      TierKind::Api => ResponseSnapshot::offline(),
      TierKind::Realtime => ResponseSnapshot::simulated_offline(),
      TierKind::Media | TierKind::Model | TierKind::Asset => {
        ResponseSnapshot::unavailable("resource unavailable")
      }
      TierKind::Static => {
        if request.navigate || request.accepts_html() {
          // Navigations must resolve to something renderable.
          let tier_name = TierKind::Static.versioned(&self.version);
          if let Ok(offline_url) = self.origin.join(&self.offline_path) {
            if let Some(page) = self.cached(&tier_name, &canonical_key(&offline_url)) {
              return page;
            }
          }
          ResponseSnapshot::offline_page()
        } else {
          ResponseSnapshot::unavailable("resource unavailable")
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::testing::MockFetcher;
  use crate::tier::MemoryTierStore;
  use serde_json::Value;
  use url::Url;

  struct Harness {
    store: Arc<MemoryTierStore>,
    fetcher: Arc<MockFetcher>,
    executor: StrategyExecutor,
  }

  fn harness() -> Harness {
    let store = Arc::new(MemoryTierStore::new());
    let fetcher = Arc::new(MockFetcher::new());
    let executor = StrategyExecutor::new(
      Arc::clone(&store) as Arc<dyn TierStore>,
      Arc::clone(&fetcher) as Arc<dyn Fetcher>,
      &Config::for_tests(),
    );
    Harness {
      store,
      fetcher,
      executor,
    }
  }

  fn get(url: &str) -> RequestDescriptor {
    RequestDescriptor::get(Url::parse(url).unwrap())
  }

  fn route(tier: TierKind, strategy: Strategy) -> Route {
    Route {
      tier,
      strategy,
      timeout: None,
      max_age: None,
    }
  }

  fn body(text: &str) -> ResponseSnapshot {
    ResponseSnapshot::text(200, "text/plain", text)
  }

  #[tokio::test]
  async fn test_network_first_stores_and_returns_network_response() {
    let h = harness();
    let req = get("https://app.example.test/api/items");
    h.fetcher.respond(&req.cache_key(), body("fresh"));

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Api, Strategy::NetworkFirst))
      .await;

    assert_eq!(resp.body_text(), "fresh");
    let stored = h.store.get("api-v2", &req.cache_key()).unwrap().unwrap();
    assert_eq!(stored.body_text(), "fresh");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache_when_offline() {
    let h = harness();
    let req = get("https://app.example.test/api/items");
    h.store.put("api-v2", &req.cache_key(), &body("cached")).unwrap();
    h.fetcher.fail(&req.cache_key());

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Api, Strategy::NetworkFirst))
      .await;

    assert_eq!(resp.body_text(), "cached");
  }

  #[tokio::test]
  async fn test_network_first_timeout_serves_cached_fallback() {
    let h = harness();
    let req = get("https://app.example.test/api/slow");
    h.store.put("api-v2", &req.cache_key(), &body("cached")).unwrap();
    h.fetcher
      .slow(&req.cache_key(), Duration::from_millis(300), body("late"));

    let mut r = route(TierKind::Api, Strategy::NetworkFirst);
    r.timeout = Some(Duration::from_millis(50));
    let resp = h.executor.execute(&req, &r).await;

    assert_eq!(resp.body_text(), "cached");

    // The timed-out fetch was dropped before it could overwrite the cache.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stored = h.store.get("api-v2", &req.cache_key()).unwrap().unwrap();
    assert_eq!(stored.body_text(), "cached");
  }

  #[tokio::test]
  async fn test_network_first_offline_without_cache_returns_structured_json() {
    let h = harness();
    let req = get("https://app.example.test/api/items");
    h.fetcher.fail(&req.cache_key());

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Api, Strategy::NetworkFirst))
      .await;

    assert_eq!(resp.status, 503);
    let parsed: Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(parsed["error"], "offline");
  }

  #[tokio::test]
  async fn test_cache_first_hit_returns_cached_and_revalidates() {
    let h = harness();
    let req = get("https://app.example.test/models/base/model.json");
    h.store.put("model-v2", &req.cache_key(), &body("old")).unwrap();
    h.fetcher.respond(&req.cache_key(), body("new"));

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Model, Strategy::CacheFirst))
      .await;
    assert_eq!(resp.body_text(), "old");

    // Let the detached revalidation task run.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stored = h.store.get("model-v2", &req.cache_key()).unwrap().unwrap();
    assert_eq!(stored.body_text(), "new");
  }

  #[tokio::test]
  async fn test_cache_first_is_idempotent_offline() {
    let h = harness();
    let req = get("https://app.example.test/models/base/model.json");
    h.store.put("model-v2", &req.cache_key(), &body("pinned")).unwrap();
    h.fetcher.fail(&req.cache_key());

    let first = h
      .executor
      .execute(&req, &route(TierKind::Model, Strategy::CacheFirst))
      .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = h
      .executor
      .execute(&req, &route(TierKind::Model, Strategy::CacheFirst))
      .await;

    assert_eq!(first.body, second.body);
    assert_eq!(first.status, second.status);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let h = harness();
    let req = get("https://app.example.test/media/logo.png");
    h.fetcher.respond(&req.cache_key(), body("pixels"));

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Media, Strategy::CacheFirst))
      .await;

    assert_eq!(resp.body_text(), "pixels");
    assert!(h.store.get("media-v2", &req.cache_key()).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline_returns_404_for_binary_tier() {
    let h = harness();
    let req = get("https://app.example.test/models/missing.bin");
    h.fetcher.fail(&req.cache_key());

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Model, Strategy::CacheFirst))
      .await;

    assert_eq!(resp.status, 404);
  }

  #[tokio::test]
  async fn test_cache_first_stale_entry_prefers_network() {
    let h = harness();
    let req = get("https://app.example.test/api/catalog");
    let mut stale = body("stale");
    stale.stored_at = chrono::Utc::now() - chrono::Duration::hours(2);
    h.store.put("api-v2", &req.cache_key(), &stale).unwrap();
    h.fetcher.respond(&req.cache_key(), body("refetched"));

    let mut r = route(TierKind::Api, Strategy::CacheFirst);
    r.max_age = Some(Duration::from_secs(3600));
    let resp = h.executor.execute(&req, &r).await;

    assert_eq!(resp.body_text(), "refetched");
  }

  #[tokio::test]
  async fn test_cache_first_stale_entry_still_served_offline() {
    let h = harness();
    let req = get("https://app.example.test/api/catalog");
    let mut stale = body("stale");
    stale.stored_at = chrono::Utc::now() - chrono::Duration::hours(2);
    h.store.put("api-v2", &req.cache_key(), &stale).unwrap();
    h.fetcher.fail(&req.cache_key());

    let mut r = route(TierKind::Api, Strategy::CacheFirst);
    r.max_age = Some(Duration::from_secs(3600));
    let resp = h.executor.execute(&req, &r).await;

    assert_eq!(resp.body_text(), "stale");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_old_then_updates() {
    let h = harness();
    let req = get("https://app.example.test/api/community/signs");
    h.store.put("api-v2", &req.cache_key(), &body("old")).unwrap();
    h.fetcher.respond(&req.cache_key(), body("new"));

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Api, Strategy::StaleWhileRevalidate))
      .await;
    assert_eq!(resp.body_text(), "old");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let stored = h.store.get("api-v2", &req.cache_key()).unwrap().unwrap();
    assert_eq!(stored.body_text(), "new");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_awaits_network() {
    let h = harness();
    let req = get("https://app.example.test/api/community/signs");
    h.fetcher.respond(&req.cache_key(), body("direct"));

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Api, Strategy::StaleWhileRevalidate))
      .await;

    assert_eq!(resp.body_text(), "direct");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_offline_falls_back() {
    let h = harness();
    let req = get("https://app.example.test/api/community/signs");
    h.fetcher.fail(&req.cache_key());

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Api, Strategy::StaleWhileRevalidate))
      .await;

    assert_eq!(resp.status, 503);
  }

  #[tokio::test]
  async fn test_network_only_never_caches_plain_resources() {
    let h = harness();
    let req = get("https://app.example.test/realtime/feed");
    h.fetcher.respond(&req.cache_key(), body("live"));

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Realtime, Strategy::NetworkOnly))
      .await;

    assert_eq!(resp.body_text(), "live");
    assert!(h.store.get("realtime-v2", &req.cache_key()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_network_only_allowlisted_metadata_is_cached() {
    let h = harness();
    let req = get("https://app.example.test/realtime/decoder/model.json");
    h.fetcher.respond(&req.cache_key(), body("weights-index"));

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Realtime, Strategy::NetworkOnly))
      .await;

    assert_eq!(resp.body_text(), "weights-index");
    assert!(h.store.get("realtime-v2", &req.cache_key()).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_network_only_offline_returns_simulated_mode() {
    let h = harness();
    let req = get("https://app.example.test/realtime/feed");
    h.fetcher.fail(&req.cache_key());

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Realtime, Strategy::NetworkOnly))
      .await;

    let parsed: Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(parsed["error"], "offline");
    assert_eq!(parsed["mode"], "simulated");
  }

  #[tokio::test]
  async fn test_cache_only_returns_unavailable_on_empty_cache() {
    let h = harness();

    let media = get("https://app.example.test/media/clip.mp4");
    let resp = h
      .executor
      .execute(&media, &route(TierKind::Media, Strategy::CacheOnly))
      .await;
    assert_eq!(resp.status, 404);

    let api = get("https://app.example.test/api/items");
    let resp = h
      .executor
      .execute(&api, &route(TierKind::Api, Strategy::CacheOnly))
      .await;
    assert_eq!(resp.status, 503);
    let parsed: Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(parsed["error"], "offline");
  }

  #[tokio::test]
  async fn test_cache_only_never_touches_network() {
    let h = harness();
    let req = get("https://app.example.test/media/clip.mp4");
    h.store.put("media-v2", &req.cache_key(), &body("frames")).unwrap();

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Media, Strategy::CacheOnly))
      .await;

    assert_eq!(resp.body_text(), "frames");
    assert!(h.fetcher.calls().is_empty());
  }

  #[tokio::test]
  async fn test_navigation_fallback_prefers_precached_offline_page() {
    let h = harness();
    let offline_key = "https://app.example.test/offline.html";
    h.store
      .put("static-v2", offline_key, &ResponseSnapshot::text(200, "text/html", "<html>saved</html>"))
      .unwrap();

    let req = RequestDescriptor::navigation(Url::parse("https://app.example.test/dash").unwrap());
    h.fetcher.fail(&req.cache_key());

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Static, Strategy::NetworkFirst))
      .await;

    assert_eq!(resp.body_text(), "<html>saved</html>");
  }

  #[tokio::test]
  async fn test_navigation_fallback_synthesizes_page_without_precache() {
    let h = harness();
    let req = RequestDescriptor::navigation(Url::parse("https://app.example.test/dash").unwrap());
    h.fetcher.fail(&req.cache_key());

    let resp = h
      .executor
      .execute(&req, &route(TierKind::Static, Strategy::NetworkFirst))
      .await;

    assert_eq!(resp.headers.get("content-type").unwrap(), "text/html");
    assert!(!resp.body.is_empty());
  }
}
