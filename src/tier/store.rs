//! Tier store trait and its SQLite and in-memory backends.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{EngineError, Result};
use crate::http::ResponseSnapshot;

/// Per-tier entry count, reported in cache status notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStatus {
  pub name: String,
  pub size: u64,
}

/// Storage backend for cache tiers.
///
/// Guarantees read-after-write within a tier and nothing across tiers. The
/// host environment may evict entries under storage pressure, so callers
/// must treat every `get` as possibly absent even for a key previously
/// written.
pub trait TierStore: Send + Sync {
  /// Create the tier if absent. Idempotent.
  fn open_tier(&self, tier: &str) -> Result<()>;

  fn get(&self, tier: &str, key: &str) -> Result<Option<ResponseSnapshot>>;

  /// Upsert. Overwrites an existing entry silently; all-or-nothing.
  fn put(&self, tier: &str, key: &str, entry: &ResponseSnapshot) -> Result<()>;

  fn delete(&self, tier: &str, key: &str) -> Result<()>;

  /// Fresh enumeration of the tier's keys on every call.
  fn keys(&self, tier: &str) -> Result<Vec<String>>;

  /// Remove all entries and free the tier.
  fn delete_tier(&self, tier: &str) -> Result<()>;

  /// Every tier currently known, including empty ones.
  fn list_tiers(&self) -> Result<Vec<String>>;

  fn tier_size(&self, tier: &str) -> Result<u64>;
}

/// Durable SQLite-backed tier store.
pub struct SqliteTierStore {
  conn: Mutex<Connection>,
}

/// Schema for tier tables.
const TIER_SCHEMA: &str = r#"
-- Tier registry, so empty tiers survive enumeration
CREATE TABLE IF NOT EXISTS tiers (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots, keyed by canonical URL within a tier
CREATE TABLE IF NOT EXISTS entries (
    tier TEXT NOT NULL,
    key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (tier, key)
);

CREATE INDEX IF NOT EXISTS idx_entries_tier ON entries(tier);
"#;

impl SqliteTierStore {
  /// Open or create the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Default cache database path.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| EngineError::StorageFailure("could not determine data directory".to_string()))?;

    Ok(data_dir.join("standby").join("cache.db"))
  }

  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| EngineError::StorageFailure(format!("failed to create cache directory: {e}")))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| EngineError::StorageFailure(format!("failed to open cache database at {}: {e}", path.display())))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Ephemeral store for tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    self.lock()?.execute_batch(TIER_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| EngineError::StorageFailure(format!("lock poisoned: {e}")))
  }
}

impl TierStore for SqliteTierStore {
  fn open_tier(&self, tier: &str) -> Result<()> {
    self.lock()?.execute(
      "INSERT OR IGNORE INTO tiers (name) VALUES (?)",
      params![tier],
    )?;
    Ok(())
  }

  fn get(&self, tier: &str, key: &str) -> Result<Option<ResponseSnapshot>> {
    let conn = self.lock()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM entries WHERE tier = ? AND key = ?",
        params![tier, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, stored_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)?;
        Ok(Some(ResponseSnapshot {
          status,
          headers,
          body,
          stored_at: parse_datetime(&stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, tier: &str, key: &str, entry: &ResponseSnapshot) -> Result<()> {
    let headers = serde_json::to_string(&entry.headers)?;
    let conn = self.lock()?;

    conn.execute(
      "INSERT OR IGNORE INTO tiers (name) VALUES (?)",
      params![tier],
    )?;
    conn.execute(
      "INSERT OR REPLACE INTO entries (tier, key, status, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        tier,
        key,
        entry.status,
        headers,
        entry.body,
        entry.stored_at.to_rfc3339()
      ],
    )?;

    Ok(())
  }

  fn delete(&self, tier: &str, key: &str) -> Result<()> {
    self.lock()?.execute(
      "DELETE FROM entries WHERE tier = ? AND key = ?",
      params![tier, key],
    )?;
    Ok(())
  }

  fn keys(&self, tier: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM entries WHERE tier = ? ORDER BY key")?;
    let keys = stmt
      .query_map(params![tier], |row| row.get(0))?
      .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(keys)
  }

  fn delete_tier(&self, tier: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM entries WHERE tier = ?", params![tier])?;
    conn.execute("DELETE FROM tiers WHERE name = ?", params![tier])?;
    Ok(())
  }

  fn list_tiers(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT name FROM tiers ORDER BY name")?;
    let tiers = stmt
      .query_map([], |row| row.get(0))?
      .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(tiers)
  }

  fn tier_size(&self, tier: &str) -> Result<u64> {
    let count: u64 = self.lock()?.query_row(
      "SELECT COUNT(*) FROM entries WHERE tier = ?",
      params![tier],
      |row| row.get(0),
    )?;
    Ok(count)
  }
}

/// In-memory tier store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryTierStore {
  tiers: Mutex<BTreeMap<String, BTreeMap<String, ResponseSnapshot>>>,
}

impl MemoryTierStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, BTreeMap<String, ResponseSnapshot>>>> {
    self
      .tiers
      .lock()
      .map_err(|e| EngineError::StorageFailure(format!("lock poisoned: {e}")))
  }
}

impl TierStore for MemoryTierStore {
  fn open_tier(&self, tier: &str) -> Result<()> {
    self.lock()?.entry(tier.to_string()).or_default();
    Ok(())
  }

  fn get(&self, tier: &str, key: &str) -> Result<Option<ResponseSnapshot>> {
    Ok(
      self
        .lock()?
        .get(tier)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  fn put(&self, tier: &str, key: &str, entry: &ResponseSnapshot) -> Result<()> {
    self
      .lock()?
      .entry(tier.to_string())
      .or_default()
      .insert(key.to_string(), entry.clone());
    Ok(())
  }

  fn delete(&self, tier: &str, key: &str) -> Result<()> {
    if let Some(entries) = self.lock()?.get_mut(tier) {
      entries.remove(key);
    }
    Ok(())
  }

  fn keys(&self, tier: &str) -> Result<Vec<String>> {
    Ok(
      self
        .lock()?
        .get(tier)
        .map(|entries| entries.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }

  fn delete_tier(&self, tier: &str) -> Result<()> {
    self.lock()?.remove(tier);
    Ok(())
  }

  fn list_tiers(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn tier_size(&self, tier: &str) -> Result<u64> {
    Ok(
      self
        .lock()?
        .get(tier)
        .map(|entries| entries.len() as u64)
        .unwrap_or(0),
    )
  }
}

/// Parse an RFC 3339 timestamp stored alongside an entry.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| EngineError::StorageFailure(format!("failed to parse timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(body: &str) -> ResponseSnapshot {
    ResponseSnapshot::text(200, "text/plain", body)
  }

  #[test]
  fn test_put_then_get_round_trips() {
    let store = SqliteTierStore::open_in_memory().unwrap();
    let original = entry("hello");

    store.put("api-v1", "https://a.test/x", &original).unwrap();
    let fetched = store.get("api-v1", "https://a.test/x").unwrap().unwrap();

    assert_eq!(fetched.status, original.status);
    assert_eq!(fetched.body, original.body);
    assert_eq!(fetched.headers, original.headers);
  }

  #[test]
  fn test_get_absent_key_returns_none() {
    let store = SqliteTierStore::open_in_memory().unwrap();
    assert!(store.get("api-v1", "https://a.test/missing").unwrap().is_none());
  }

  #[test]
  fn test_tiers_are_isolated() {
    let store = SqliteTierStore::open_in_memory().unwrap();
    store.put("model-v1", "https://a.test/k", &entry("model")).unwrap();

    assert!(store.get("media-v1", "https://a.test/k").unwrap().is_none());
    assert!(store.get("model-v1", "https://a.test/k").unwrap().is_some());
  }

  #[test]
  fn test_put_overwrites_silently() {
    let store = SqliteTierStore::open_in_memory().unwrap();
    store.put("api-v1", "https://a.test/k", &entry("old")).unwrap();
    store.put("api-v1", "https://a.test/k", &entry("new")).unwrap();

    let fetched = store.get("api-v1", "https://a.test/k").unwrap().unwrap();
    assert_eq!(fetched.body_text(), "new");
    assert_eq!(store.tier_size("api-v1").unwrap(), 1);
  }

  #[test]
  fn test_keys_enumerates_fresh_each_call() {
    let store = SqliteTierStore::open_in_memory().unwrap();
    store.put("api-v1", "https://a.test/1", &entry("a")).unwrap();
    store.put("api-v1", "https://a.test/2", &entry("b")).unwrap();

    assert_eq!(store.keys("api-v1").unwrap().len(), 2);

    store.delete("api-v1", "https://a.test/1").unwrap();
    assert_eq!(store.keys("api-v1").unwrap(), vec!["https://a.test/2"]);
  }

  #[test]
  fn test_delete_tier_removes_entries_and_registration() {
    let store = SqliteTierStore::open_in_memory().unwrap();
    store.open_tier("static-v1").unwrap();
    store.put("static-v1", "https://a.test/k", &entry("x")).unwrap();

    store.delete_tier("static-v1").unwrap();

    assert!(store.get("static-v1", "https://a.test/k").unwrap().is_none());
    assert!(store.list_tiers().unwrap().is_empty());
  }

  #[test]
  fn test_open_tier_is_idempotent_and_lists_empty_tiers() {
    let store = SqliteTierStore::open_in_memory().unwrap();
    store.open_tier("asset-v1").unwrap();
    store.open_tier("asset-v1").unwrap();

    assert_eq!(store.list_tiers().unwrap(), vec!["asset-v1"]);
    assert_eq!(store.tier_size("asset-v1").unwrap(), 0);
  }

  #[test]
  fn test_memory_store_matches_contract() {
    let store = MemoryTierStore::new();
    store.put("api-v1", "https://a.test/k", &entry("mem")).unwrap();

    assert_eq!(
      store.get("api-v1", "https://a.test/k").unwrap().unwrap().body_text(),
      "mem"
    );
    assert!(store.get("media-v1", "https://a.test/k").unwrap().is_none());

    store.delete_tier("api-v1").unwrap();
    assert!(store.list_tiers().unwrap().is_empty());
  }
}
