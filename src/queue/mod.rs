//! Local durable queue of pending writes.
//!
//! Mutations are stored in SQLite in arrival order and replayed by the sync
//! engine in the same order. Items are never deleted one by one: they are
//! flagged `synced` and removed in bulk by [`OfflineQueue::clear`].

mod dead_letter;
mod photos;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::Database;

pub use dead_letter::{DeadLetter, DeadLetterSource};
pub use photos::PhotoItem;

/// Remote operation a queued item replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  /// Insert a new document into the collection
  Create,
  /// Merge the payload onto an existing document
  Update,
  /// Remove a document
  Delete,
}

impl MutationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Delete => "delete",
    }
  }
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown mutation kind: {0}")]
pub struct UnknownMutationKind(String);

impl FromStr for MutationKind {
  type Err = UnknownMutationKind;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      other => Err(UnknownMutationKind(other.to_string())),
    }
  }
}

/// A pending (or settled) mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
  pub id: i64,
  pub kind: MutationKind,
  pub collection: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub synced: bool,
  /// Set when the item was abandoned rather than applied
  pub failed: bool,
  pub sync_attempts: u32,
  pub last_error: Option<String>,
  pub synced_at: Option<DateTime<Utc>>,
}

/// SQLite-backed queue of offline mutations.
#[derive(Clone)]
pub struct OfflineQueue {
  db: Arc<Database>,
}

const ITEM_COLUMNS: &str = "id, kind, collection, payload, created_at, synced, failed, \
                            sync_attempts, last_error, synced_at";

impl OfflineQueue {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Persist a new pending mutation and return its id.
  pub fn enqueue(&self, kind: MutationKind, collection: &str, payload: &Value) -> Result<i64> {
    if collection.trim().is_empty() {
      return Err(eyre!("Cannot enqueue a {} without a target collection", kind));
    }

    let data =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT INTO offline_queue (kind, collection, payload, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![kind.as_str(), collection, data, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    let id = conn.last_insert_rowid();
    debug!(item_id = id, %kind, collection, "Mutation queued");
    Ok(id)
  }

  /// All unsynced items in replay order.
  pub fn list_pending(&self) -> Result<Vec<QueueItem>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM offline_queue WHERE synced = 0 ORDER BY id ASC"
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let items = stmt
      .query_map([], row_to_item)
      .map_err(|e| eyre!("Failed to query pending mutations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queued mutation: {}", e))?;

    Ok(items)
  }

  pub fn get(&self, id: i64) -> Result<Option<QueueItem>> {
    let conn = self.db.lock()?;
    conn
      .query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM offline_queue WHERE id = ?1"),
        [id],
        row_to_item,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load queued mutation {}: {}", id, e))
  }

  /// Flag an item as applied.
  ///
  /// Idempotent: an already-synced item keeps its original `synced_at`.
  /// Returns `false` only when no item with that id exists.
  pub fn mark_synced(&self, id: i64) -> Result<bool> {
    let conn = self.db.lock()?;
    let changed = conn
      .execute(
        "UPDATE offline_queue SET synced = 1, synced_at = ?1 WHERE id = ?2 AND synced = 0",
        params![Utc::now().to_rfc3339(), id],
      )
      .map_err(|e| eyre!("Failed to mark mutation {} synced: {}", id, e))?;

    if changed > 0 {
      return Ok(true);
    }

    item_exists(&conn, id)
  }

  /// Count one failed remote application and return the new attempt count.
  pub fn record_failure(&self, id: i64, error: &str) -> Result<u32> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "UPDATE offline_queue SET sync_attempts = sync_attempts + 1, last_error = ?1
       WHERE id = ?2 AND synced = 0",
      params![error, id],
    )
    .map_err(|e| eyre!("Failed to record attempt for mutation {}: {}", id, e))?;

    let attempts: Option<u32> = tx
      .query_row(
        "SELECT sync_attempts FROM offline_queue WHERE id = ?1",
        [id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read attempts for mutation {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    attempts.ok_or_else(|| eyre!("Queued mutation {} not found", id))
  }

  /// Stop retrying an item: it is flagged synced + failed and copied to the
  /// dead-letter store in the same transaction.
  pub fn abandon(&self, id: i64, error: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let changed = tx
      .execute(
        "UPDATE offline_queue SET synced = 1, failed = 1, synced_at = ?1, last_error = ?2
         WHERE id = ?3 AND synced = 0",
        params![now, error, id],
      )
      .map_err(|e| eyre!("Failed to abandon mutation {}: {}", id, e))?;

    if changed > 0 {
      tx.execute(
        "INSERT INTO dead_letter (source, item_id, collection, kind, payload, error, attempts, failed_at)
         SELECT ?1, id, collection, kind, payload, ?2, sync_attempts, ?3
         FROM offline_queue WHERE id = ?4",
        params![DeadLetterSource::Mutation.as_str(), error, now, id],
      )
      .map_err(|e| eyre!("Failed to write dead letter for mutation {}: {}", id, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    if changed > 0 {
      warn!(item_id = id, error, "Mutation abandoned");
    }
    Ok(())
  }

  /// Remove every queued mutation regardless of state.
  pub fn clear(&self) -> Result<usize> {
    let conn = self.db.lock()?;
    let removed = conn
      .execute("DELETE FROM offline_queue", [])
      .map_err(|e| eyre!("Failed to clear offline queue: {}", e))?;

    info!(removed, "Offline queue cleared");
    Ok(removed)
  }

  /// Drop finished work: uploaded or abandoned photos right away, applied
  /// and abandoned mutations once nothing is pending.
  ///
  /// Returns the number of rows removed. Abandoned items stay in the
  /// dead-letter store.
  pub fn compact(&self) -> Result<usize> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let photos = tx
      .execute("DELETE FROM offline_photos WHERE uploaded = 1", [])
      .map_err(|e| eyre!("Failed to compact photo queue: {}", e))?;

    let pending: i64 = tx
      .query_row("SELECT pending FROM queue_stats WHERE id = 1", [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to count pending mutations: {}", e))?;
    let mutations = if pending > 0 {
      0
    } else {
      tx.execute("DELETE FROM offline_queue WHERE synced = 1", [])
        .map_err(|e| eyre!("Failed to compact offline queue: {}", e))?
    };

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    if mutations + photos > 0 {
      debug!(mutations, photos, "Finished items compacted");
    }
    Ok(mutations + photos)
  }

  /// Number of unsynced mutations, read from the trigger-maintained counter.
  pub fn count(&self) -> Result<u64> {
    let conn = self.db.lock()?;
    let pending: i64 = conn
      .query_row("SELECT pending FROM queue_stats WHERE id = 1", [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to count pending mutations: {}", e))?;

    Ok(pending.max(0) as u64)
  }
}

fn item_exists(conn: &rusqlite::Connection, id: i64) -> Result<bool> {
  conn
    .query_row(
      "SELECT EXISTS(SELECT 1 FROM offline_queue WHERE id = ?1)",
      [id],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to look up mutation {}: {}", id, e))
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
  let kind: String = row.get(1)?;
  let payload: String = row.get(3)?;
  let created_at: String = row.get(4)?;
  let synced_at: Option<String> = row.get(9)?;

  Ok(QueueItem {
    id: row.get(0)?,
    kind: kind.parse().map_err(|e| conversion_error(1, e))?,
    collection: row.get(2)?,
    payload: serde_json::from_str(&payload).map_err(|e| conversion_error(3, e))?,
    created_at: parse_timestamp(4, &created_at)?,
    synced: row.get(5)?,
    failed: row.get(6)?,
    sync_attempts: row.get(7)?,
    last_error: row.get(8)?,
    synced_at: synced_at
      .map(|s| parse_timestamp(9, &s))
      .transpose()?,
  })
}

pub(crate) fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
  E: std::error::Error + Send + Sync + 'static,
{
  rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}
