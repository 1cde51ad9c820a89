//! Engine error taxonomy.

use thiserror::Error;

/// Errors produced inside the engine.
///
/// `NetworkUnavailable` and `CacheMiss` are always recovered by the strategy
/// executor and converted into cached fallbacks or synthesized responses;
/// they never cross the request boundary. `StorageFailure` is swallowed and
/// logged on best-effort writes, and fatal only on the critical install
/// path. `SyncDeliveryFailure` is internal retry bookkeeping.
#[derive(Debug, Error)]
pub enum EngineError {
  /// The network collaborator failed, was cancelled, or timed out.
  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  /// No cache entry exists for the requested key.
  #[error("cache miss for {0}")]
  CacheMiss(String),

  /// The persistent store rejected a read or write.
  #[error("storage failure: {0}")]
  StorageFailure(String),

  /// A pending operation's delivery attempt failed.
  #[error("sync delivery failed: {0}")]
  SyncDeliveryFailure(String),
}

impl From<rusqlite::Error> for EngineError {
  fn from(err: rusqlite::Error) -> Self {
    EngineError::StorageFailure(err.to_string())
  }
}

impl From<serde_json::Error> for EngineError {
  fn from(err: serde_json::Error) -> Self {
    EngineError::StorageFailure(err.to_string())
  }
}

/// Convenience alias used throughout the engine.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
