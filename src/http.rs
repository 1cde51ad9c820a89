//! Request descriptors and stored response snapshots.
//!
//! These are the opaque request/response pairs the engine routes and caches.
//! The cache identity of a request is its canonicalized absolute URL; request
//! headers never participate in the key, so two requests differing only in
//! headers collide on one entry (last write wins).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use url::{Position, Url};

/// HTTP methods the interception boundary distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Only GET requests are classified for caching.
  pub fn is_get(&self) -> bool {
    matches!(self, Method::Get)
  }
}

/// An intercepted outgoing request. Immutable once classified.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
  pub method: Method,
  pub url: Url,
  /// Subset of request headers relevant to classification, lowercased names.
  pub headers: BTreeMap<String, String>,
  pub has_body: bool,
  /// Set when the request is a top-level navigation.
  pub navigate: bool,
}

impl RequestDescriptor {
  /// A plain GET request for the given URL.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      headers: BTreeMap::new(),
      has_body: false,
      navigate: false,
    }
  }

  /// A top-level navigation request (GET, accepts HTML).
  pub fn navigation(url: Url) -> Self {
    Self {
      navigate: true,
      ..Self::get(url)
    }
    .with_header("accept", "text/html,application/xhtml+xml")
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_lowercase(), value.to_string());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  /// Whether the request negotiates for an HTML document.
  pub fn accepts_html(&self) -> bool {
    self
      .header("accept")
      .map(|accept| accept.contains("text/html"))
      .unwrap_or(false)
  }

  /// Cache key for this request: the canonical absolute URL.
  pub fn cache_key(&self) -> String {
    canonical_key(&self.url)
  }
}

/// Canonical cache identity for a URL: scheme + host + path + query, with
/// the fragment dropped. Header and method variants are intentionally not
/// part of the identity (single-variant caching).
pub fn canonical_key(url: &Url) -> String {
  url[..Position::AfterQuery].to_string()
}

/// A stored response snapshot: status, headers, body, and when it was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
      stored_at: Utc::now(),
    }
  }

  /// A response with a JSON body and matching content type.
  pub fn json(status: u16, body: &Value) -> Self {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Self::new(status, headers, body.to_string().into_bytes())
  }

  /// A response with a text body of the given content type.
  pub fn text(status: u16, content_type: &str, body: &str) -> Self {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), content_type.to_string());
    Self::new(status, headers, body.as_bytes().to_vec())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Time elapsed since the snapshot was stored.
  pub fn age(&self) -> chrono::Duration {
    Utc::now() - self.stored_at
  }

  /// Body interpreted as UTF-8 text, lossy.
  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Structured offline response for API routes. Callers branch on the
  /// stable `error` field instead of a raw network error.
  pub fn offline() -> Self {
    Self::json(
      503,
      &json!({
        "error": "offline",
        "message": "You are offline. Using cached data.",
        "offline": true,
        "timestamp": Utc::now().to_rfc3339(),
      }),
    )
  }

  /// Offline response for real-time routes whose callers expect a
  /// structured result even with no connectivity.
  pub fn simulated_offline() -> Self {
    Self::json(
      200,
      &json!({
        "error": "offline",
        "mode": "simulated",
        "timestamp": Utc::now().to_rfc3339(),
      }),
    )
  }

  /// Unavailable response for binary asset tiers.
  pub fn unavailable(message: &str) -> Self {
    Self::text(404, "text/plain", message)
  }

  /// Minimal synthesized offline page, used when neither the requested page
  /// nor the precached offline page is available.
  pub fn offline_page() -> Self {
    Self::text(200, "text/html", OFFLINE_PAGE_HTML)
  }
}

const OFFLINE_PAGE_HTML: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <title>Offline</title>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
  </head>
  <body>
    <h1>You are offline</h1>
    <p>This page is not available without a network connection.</p>
    <button onclick="window.location.reload()">Retry</button>
  </body>
</html>
"#;
