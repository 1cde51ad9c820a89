//! Control messages from clients and broadcast notices back to them.
//!
//! Both directions are closed enums so dispatch is exhaustive at compile
//! time; an unknown message kind is a deserialization error, not a silent
//! runtime lookup miss.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sync::OperationKind;
use crate::tier::TierStatus;

/// Messages accepted from connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Force immediate activation without waiting.
  SkipWaiting,
  /// Drop every tier that does not belong to the current version.
  ClearCache,
  /// Queue a client-originated write for later delivery.
  SaveOffline {
    kind: OperationKind,
    payload: Value,
  },
  GetCacheStatus,
  /// Force a flush of every queue kind.
  SyncNow,
  /// Force pre-population of pack resources matching the selector.
  DownloadPack {
    selector: String,
  },
}

/// Structured notices broadcast to all connected clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notice {
  Activated {
    version: String,
    timestamp: DateTime<Utc>,
  },
  CacheStatus {
    #[serde(rename = "perTier")]
    per_tier: Vec<TierStatus>,
    timestamp: DateTime<Utc>,
  },
  OperationSynced {
    id: i64,
    timestamp: DateTime<Utc>,
  },
}

impl Notice {
  pub fn activated(version: &str) -> Self {
    Notice::Activated {
      version: version.to_string(),
      timestamp: Utc::now(),
    }
  }

  pub fn cache_status(per_tier: Vec<TierStatus>) -> Self {
    Notice::CacheStatus {
      per_tier,
      timestamp: Utc::now(),
    }
  }

  pub fn operation_synced(id: i64) -> Self {
    Notice::OperationSynced {
      id,
      timestamp: Utc::now(),
    }
  }
}
