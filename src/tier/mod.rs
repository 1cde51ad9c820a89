//! Named, versioned cache tiers.
//!
//! A tier is an independent cache namespace. Physical tier names embed the
//! lifecycle version (`"api-v3"`), and activation deletes every tier whose
//! version tag differs from the current one. That strict-equality rule is
//! the only garbage collection the engine performs.

mod store;

use serde::{Deserialize, Serialize};

pub use store::{MemoryTierStore, SqliteTierStore, TierStatus, TierStore};

/// Logical cache namespaces the classifier can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
  Static,
  Api,
  Media,
  Model,
  Realtime,
  Asset,
}

impl TierKind {
  pub const ALL: [TierKind; 6] = [
    TierKind::Static,
    TierKind::Api,
    TierKind::Media,
    TierKind::Model,
    TierKind::Realtime,
    TierKind::Asset,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      TierKind::Static => "static",
      TierKind::Api => "api",
      TierKind::Media => "media",
      TierKind::Model => "model",
      TierKind::Realtime => "realtime",
      TierKind::Asset => "asset",
    }
  }

  /// Physical tier name for a lifecycle version, e.g. `static-v3`.
  pub fn versioned(&self, version: &str) -> String {
    format!("{}-{}", self.as_str(), version)
  }
}

/// Whether a physical tier name belongs to the given lifecycle version.
/// Strict equality on the version tag: a tier is either fully current or
/// eligible for deletion, never partially migrated.
pub fn is_current(tier_name: &str, version: &str) -> bool {
  tier_name
    .strip_suffix(version)
    .and_then(|prefix| prefix.strip_suffix('-'))
    .is_some_and(|kind| !kind.is_empty())
}
