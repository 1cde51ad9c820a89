use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::strategy::Strategy;
use crate::sync::OperationKind;

/// Engine configuration, supplied externally. The engine never mutates it;
/// an instance owns a reference to the loaded tables for its lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Lifecycle version token shared by every tier, e.g. "v3".
  pub version: String,
  /// Origin against which relative resource paths are resolved.
  #[serde(deserialize_with = "deserialize_url")]
  pub origin: Url,
  /// Precached page served to navigations when everything else fails.
  #[serde(default = "default_offline_path")]
  pub offline_path: String,
  /// Network timeout for network-first routes without their own.
  #[serde(default = "default_timeout_ms")]
  pub default_timeout_ms: u64,
  #[serde(default)]
  pub routing: RoutingConfig,
  /// Endpoint-to-strategy table for API routes.
  #[serde(default)]
  pub endpoints: Vec<EndpointPolicy>,
  #[serde(default)]
  pub precache: PrecacheConfig,
  /// Volatile-but-cacheable resources re-fetched on periodic triggers.
  #[serde(default)]
  pub volatile: Vec<String>,
  #[serde(default)]
  pub sync: SyncConfig,
}

/// Pattern groups the route classifier matches, in precedence order.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Path markers for real-time, low-latency routes.
  pub realtime_paths: Vec<String>,
  /// Path markers for specialized binary assets.
  pub asset_paths: Vec<String>,
  /// Extensions treated as specialized binary assets.
  pub asset_extensions: Vec<String>,
  pub api_prefix: String,
  pub model_prefix: String,
  /// Extensions treated as generic static files.
  pub static_extensions: Vec<String>,
  /// Hosts whose responses land in the media tier.
  pub cdn_hosts: Vec<String>,
  /// Strategy for requests no other group claims.
  pub default_strategy: Strategy,
  /// Sub-resource suffixes cached even inside network-only routes.
  pub network_only_cacheable: Vec<String>,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      realtime_paths: vec!["/realtime/".to_string()],
      asset_paths: vec!["/assets/immersive/".to_string()],
      asset_extensions: vec!["hdr".to_string(), "glb".to_string()],
      api_prefix: "/api/".to_string(),
      model_prefix: "/models/".to_string(),
      static_extensions: [
        "js", "css", "png", "jpg", "jpeg", "svg", "ico", "woff", "woff2",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      cdn_hosts: Vec::new(),
      default_strategy: Strategy::CacheFirst,
      network_only_cacheable: vec![".json".to_string(), ".bin".to_string()],
    }
  }
}

/// Strategy override for one API route prefix. The most specific registered
/// prefix owns a request.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointPolicy {
  pub prefix: String,
  pub strategy: Strategy,
  pub timeout_ms: Option<u64>,
  pub max_age_seconds: Option<u64>,
}

/// Resources populated into tiers at install time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PrecacheConfig {
  /// Must be cached before the install transition completes.
  pub critical: Vec<String>,
  /// Optional sets, populated in the background per tier.
  pub media: Vec<String>,
  pub model: Vec<String>,
  pub asset: Vec<String>,
}

/// Sync queue tuning and delivery endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Delivery attempts before an operation is abandoned; 0 retries forever.
  pub max_attempts: u32,
  /// Per-kind delivery endpoints for the default HTTP delivery.
  pub endpoints: BTreeMap<OperationKind, String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 8,
      endpoints: BTreeMap::new(),
    }
  }
}

fn default_offline_path() -> String {
  "/offline.html".to_string()
}

fn default_timeout_ms() -> u64 {
  3000
}

fn deserialize_url<'de, D>(deserializer: D) -> std::result::Result<Url, D::Error>
where
  D: Deserializer<'de>,
{
  let s = String::deserialize(deserializer)?;
  Url::parse(&s).map_err(serde::de::Error::custom)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./standby.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/standby/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/standby/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("standby.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("standby").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    if config.version.is_empty() {
      return Err(eyre!("Config field 'version' must not be empty"));
    }
    if config.origin.host_str().is_none() {
      return Err(eyre!("Config field 'origin' must include a host"));
    }

    Ok(config)
  }

  pub fn default_timeout(&self) -> Duration {
    Duration::from_millis(self.default_timeout_ms)
  }

  /// Resolve a configured resource path against the origin. Absolute URLs
  /// (CDN resources) pass through unchanged.
  pub fn resolve(&self, path: &str) -> std::result::Result<Url, url::ParseError> {
    if path.contains("://") {
      Url::parse(path)
    } else {
      self.origin.join(path)
    }
  }
}

#[cfg(test)]
impl Config {
  /// Baseline configuration for tests: version v2 on a synthetic origin.
  pub(crate) fn for_tests() -> Self {
    Self {
      version: "v2".to_string(),
      origin: Url::parse("https://app.example.test").expect("static test origin"),
      offline_path: default_offline_path(),
      default_timeout_ms: default_timeout_ms(),
      routing: RoutingConfig::default(),
      endpoints: Vec::new(),
      precache: PrecacheConfig::default(),
      volatile: Vec::new(),
      sync: SyncConfig::default(),
    }
  }
}
