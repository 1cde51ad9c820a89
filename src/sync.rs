//! Durable queue of pending outbound operations.
//!
//! Client-originated writes that happen while offline are persisted here and
//! redelivered in enqueue order until acknowledged or abandoned. Delivery is
//! at-least-once: an operation is removed only by an explicit ack after the
//! remote end accepted it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::net::Delivery;

/// Closed set of operation kinds the application may queue.
///
/// Operations of one kind are delivered in enqueue order; kinds have no
/// relative ordering and may be flushed independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  /// User-submitted records awaiting upload.
  Submission,
  /// Profile and settings changes.
  Profile,
  /// Community contributions with larger payloads.
  Contribution,
}

impl OperationKind {
  pub const ALL: [OperationKind; 3] = [
    OperationKind::Submission,
    OperationKind::Profile,
    OperationKind::Contribution,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      OperationKind::Submission => "submission",
      OperationKind::Profile => "profile",
      OperationKind::Contribution => "contribution",
    }
  }
}

/// A durably queued client action awaiting delivery.
#[derive(Debug, Clone)]
pub struct PendingOperation {
  pub id: i64,
  pub kind: OperationKind,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
}

/// Outcome of one flush pass over a single kind.
#[derive(Debug, Clone, Default)]
pub struct FlushReport {
  /// Ids acknowledged after successful delivery.
  pub delivered: Vec<i64>,
  /// Ids left queued with their retry count bumped.
  pub retried: Vec<i64>,
  /// Ids dropped after exhausting their retry budget.
  pub abandoned: Vec<i64>,
}

/// SQLite-backed sync queue. Entries survive process restarts.
pub struct SyncQueue {
  conn: Mutex<Connection>,
  /// Delivery attempts before an operation is abandoned; 0 retries forever.
  max_attempts: u32,
}

/// Schema for the pending-operation log.
const SYNC_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_ops (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pending_ops_kind ON pending_ops(kind, id);
"#;

impl SyncQueue {
  /// Open or create the queue at the default location.
  pub fn open(max_attempts: u32) -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path, max_attempts)
  }

  /// Default queue database path.
  fn default_path() -> Result<std::path::PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| EngineError::StorageFailure("could not determine data directory".to_string()))?;

    Ok(data_dir.join("standby").join("sync.db"))
  }

  pub fn open_at(path: &Path, max_attempts: u32) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| EngineError::StorageFailure(format!("failed to create sync directory: {e}")))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| EngineError::StorageFailure(format!("failed to open sync database at {}: {e}", path.display())))?;

    let queue = Self {
      conn: Mutex::new(conn),
      max_attempts,
    };
    queue.run_migrations()?;

    Ok(queue)
  }

  /// Ephemeral queue for tests.
  pub fn open_in_memory(max_attempts: u32) -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    let queue = Self {
      conn: Mutex::new(conn),
      max_attempts,
    };
    queue.run_migrations()?;

    Ok(queue)
  }

  fn run_migrations(&self) -> Result<()> {
    self.lock()?.execute_batch(SYNC_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| EngineError::StorageFailure(format!("lock poisoned: {e}")))
  }

  /// Append a pending operation with retry count 0. The row is persisted
  /// before this returns.
  pub fn enqueue(&self, kind: OperationKind, payload: Value) -> Result<i64> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT INTO pending_ops (kind, payload, enqueued_at) VALUES (?, ?, ?)",
      params![kind.as_str(), payload.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
  }

  /// Pending operations of one kind, in enqueue order. Non-destructive:
  /// entries leave the queue only through `ack`.
  pub fn drain(&self, kind: OperationKind) -> Result<Vec<PendingOperation>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT id, payload, enqueued_at, retry_count FROM pending_ops
       WHERE kind = ? ORDER BY id",
    )?;

    let rows = stmt.query_map(params![kind.as_str()], |row| {
      Ok((
        row.get::<_, i64>(0)?,
        row.get::<_, String>(1)?,
        row.get::<_, String>(2)?,
        row.get::<_, u32>(3)?,
      ))
    })?;

    let mut ops = Vec::new();
    for row in rows {
      let (id, payload, enqueued_at, retry_count) = row?;
      ops.push(PendingOperation {
        id,
        kind,
        payload: serde_json::from_str(&payload)?,
        enqueued_at: parse_datetime(&enqueued_at)?,
        retry_count,
      });
    }

    Ok(ops)
  }

  /// Delete an operation. Idempotent: acking a missing id is a no-op.
  pub fn ack(&self, id: i64) -> Result<()> {
    self
      .lock()?
      .execute("DELETE FROM pending_ops WHERE id = ?", params![id])?;
    Ok(())
  }

  /// Number of queued operations of one kind.
  pub fn pending(&self, kind: OperationKind) -> Result<u64> {
    let count: u64 = self.lock()?.query_row(
      "SELECT COUNT(*) FROM pending_ops WHERE kind = ?",
      params![kind.as_str()],
      |row| row.get(0),
    )?;
    Ok(count)
  }

  fn bump_retry(&self, id: i64) -> Result<u32> {
    let conn = self.lock()?;
    conn.execute(
      "UPDATE pending_ops SET retry_count = retry_count + 1 WHERE id = ?",
      params![id],
    )?;
    let count: u32 = conn.query_row(
      "SELECT retry_count FROM pending_ops WHERE id = ?",
      params![id],
      |row| row.get(0),
    )?;
    Ok(count)
  }

  /// Attempt delivery of every pending operation of one kind, in enqueue
  /// order. Successes are acked; a failure bumps the retry count and stops
  /// the pass for this kind so later operations cannot overtake it. An
  /// operation that exhausts its retry budget is abandoned.
  ///
  /// Fire-and-forget: failures are recorded in the report and the log, never
  /// surfaced to the triggering caller.
  pub async fn flush(&self, kind: OperationKind, delivery: &dyn Delivery) -> FlushReport {
    let mut report = FlushReport::default();

    let ops = match self.drain(kind) {
      Ok(ops) => ops,
      Err(e) => {
        warn!(kind = kind.as_str(), error = %e, "flush skipped: drain failed");
        return report;
      }
    };

    for op in ops {
      match delivery.deliver(&op).await {
        Ok(()) => match self.ack(op.id) {
          Ok(()) => {
            debug!(id = op.id, kind = kind.as_str(), "operation delivered");
            report.delivered.push(op.id);
          }
          Err(e) => {
            // Delivered but still queued; the next flush redelivers it.
            // At-least-once allows the duplicate.
            warn!(id = op.id, error = %e, "ack failed after delivery");
            break;
          }
        },
        Err(e) => {
          debug!(id = op.id, kind = kind.as_str(), error = %e, "delivery failed");
          let attempts = match self.bump_retry(op.id) {
            Ok(n) => n,
            Err(e) => {
              warn!(id = op.id, error = %e, "retry bookkeeping failed");
              break;
            }
          };

          if self.max_attempts > 0 && attempts >= self.max_attempts {
            warn!(
              id = op.id,
              kind = kind.as_str(),
              attempts,
              "abandoning operation after exhausting retry budget"
            );
            if self.ack(op.id).is_ok() {
              report.abandoned.push(op.id);
            }
            // The abandoned operation no longer blocks the kind.
            continue;
          }

          report.retried.push(op.id);
          break;
        }
      }
    }

    report
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| EngineError::StorageFailure(format!("failed to parse timestamp '{s}': {e}")))
}
