//! Photo attachments captured while offline.
//!
//! Kept apart from the mutation queue because blobs are large and are
//! uploaded to object storage rather than written as documents.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, warn};

use super::{conversion_error, parse_timestamp, DeadLetterSource, OfflineQueue};

/// Upload prefix for photos whose metadata names no path.
const PHOTO_PREFIX: &str = "photos";

#[derive(Debug, Clone, PartialEq)]
pub struct PhotoItem {
  pub id: i64,
  pub blob: Vec<u8>,
  pub content_type: String,
  /// Free-form metadata; `path` (if present) names the upload target
  pub metadata: Value,
  pub created_at: DateTime<Utc>,
  pub uploaded: bool,
  pub attempts: u32,
}

impl PhotoItem {
  /// Object path used for the upload.
  pub fn upload_path(&self) -> String {
    upload_path(self.id, &self.metadata)
  }
}

fn upload_path(id: i64, metadata: &Value) -> String {
  metadata
    .get("path")
    .and_then(Value::as_str)
    .map(String::from)
    .unwrap_or_else(|| format!("{}/{}", PHOTO_PREFIX, id))
}

impl OfflineQueue {
  pub fn enqueue_photo(&self, blob: &[u8], content_type: &str, metadata: &Value) -> Result<i64> {
    let metadata =
      serde_json::to_string(metadata).map_err(|e| eyre!("Failed to serialize metadata: {}", e))?;

    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT INTO offline_photos (blob, content_type, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![blob, content_type, metadata, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to queue photo: {}", e))?;

    let id = conn.last_insert_rowid();
    debug!(photo_id = id, bytes = blob.len(), "Photo queued");
    Ok(id)
  }

  /// Photos not yet uploaded, in capture order.
  pub fn pending_photos(&self) -> Result<Vec<PhotoItem>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, blob, content_type, metadata, created_at, uploaded, attempts
         FROM offline_photos WHERE uploaded = 0 ORDER BY id ASC",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let photos = stmt
      .query_map([], row_to_photo)
      .map_err(|e| eyre!("Failed to query pending photos: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queued photo: {}", e))?;

    Ok(photos)
  }

  pub fn mark_photo_uploaded(&self, id: i64) -> Result<bool> {
    let conn = self.db.lock()?;
    let changed = conn
      .execute(
        "UPDATE offline_photos SET uploaded = 1, uploaded_at = ?1 WHERE id = ?2 AND uploaded = 0",
        params![Utc::now().to_rfc3339(), id],
      )
      .map_err(|e| eyre!("Failed to mark photo {} uploaded: {}", id, e))?;

    if changed > 0 {
      return Ok(true);
    }

    conn
      .query_row(
        "SELECT EXISTS(SELECT 1 FROM offline_photos WHERE id = ?1)",
        [id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to look up photo {}: {}", id, e))
  }

  pub fn record_photo_failure(&self, id: i64, error: &str) -> Result<u32> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "UPDATE offline_photos SET attempts = attempts + 1, last_error = ?1
       WHERE id = ?2 AND uploaded = 0",
      params![error, id],
    )
    .map_err(|e| eyre!("Failed to record attempt for photo {}: {}", id, e))?;

    let attempts: Option<u32> = tx
      .query_row("SELECT attempts FROM offline_photos WHERE id = ?1", [id], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read attempts for photo {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    attempts.ok_or_else(|| eyre!("Queued photo {} not found", id))
  }

  /// Stop retrying a photo; its metadata (not the blob) goes to the dead-letter store.
  pub fn abandon_photo(&self, id: i64, error: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let changed = tx
      .execute(
        "UPDATE offline_photos SET uploaded = 1, uploaded_at = ?1, last_error = ?2
         WHERE id = ?3 AND uploaded = 0",
        params![now, error, id],
      )
      .map_err(|e| eyre!("Failed to abandon photo {}: {}", id, e))?;

    if changed > 0 {
      let metadata: String = tx
        .query_row(
          "SELECT metadata FROM offline_photos WHERE id = ?1",
          [id],
          |row| row.get(0),
        )
        .map_err(|e| eyre!("Failed to read photo {}: {}", id, e))?;
      let path = serde_json::from_str(&metadata)
        .map(|metadata: Value| upload_path(id, &metadata))
        .unwrap_or_else(|_| upload_path(id, &Value::Null));

      tx.execute(
        "INSERT INTO dead_letter (source, item_id, collection, kind, payload, error, attempts, failed_at)
         SELECT ?1, id, ?2, 'upload', metadata, ?3, attempts, ?4
         FROM offline_photos WHERE id = ?5",
        params![DeadLetterSource::Photo.as_str(), path, error, now, id],
      )
      .map_err(|e| eyre!("Failed to write dead letter for photo {}: {}", id, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    if changed > 0 {
      warn!(photo_id = id, error, "Photo upload abandoned");
    }
    Ok(())
  }

  /// Bytes of photo data held in the store, finished or not.
  pub fn photo_bytes(&self) -> Result<u64> {
    let conn = self.db.lock()?;
    let bytes: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(LENGTH(blob)), 0) FROM offline_photos",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to measure photo store: {}", e))?;
    Ok(bytes.max(0) as u64)
  }

  pub fn clear_photos(&self) -> Result<usize> {
    let conn = self.db.lock()?;
    conn
      .execute("DELETE FROM offline_photos", [])
      .map_err(|e| eyre!("Failed to clear photo queue: {}", e))
  }
}

fn row_to_photo(row: &Row<'_>) -> rusqlite::Result<PhotoItem> {
  let metadata: String = row.get(3)?;
  let created_at: String = row.get(4)?;

  Ok(PhotoItem {
    id: row.get(0)?,
    blob: row.get(1)?,
    content_type: row.get(2)?,
    metadata: serde_json::from_str(&metadata).map_err(|e| conversion_error(3, e))?,
    created_at: parse_timestamp(4, &created_at)?,
    uploaded: row.get(5)?,
    attempts: row.get(6)?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::queue::MutationKind;
  use serde_json::json;
  use std::sync::Arc;

  fn queue() -> OfflineQueue {
    OfflineQueue::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  #[test]
  fn test_photos_are_pending_until_uploaded() {
    let q = queue();
    let a = q
      .enqueue_photo(&[1, 2, 3], "image/jpeg", &json!({"path": "visitas/v1/a.jpg"}))
      .unwrap();
    let b = q.enqueue_photo(&[4], "image/png", &json!({})).unwrap();

    let pending = q.pending_photos().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].blob, vec![1, 2, 3]);
    assert_eq!(pending[0].upload_path(), "visitas/v1/a.jpg");
    assert_eq!(pending[1].upload_path(), format!("photos/{}", b));

    assert!(q.mark_photo_uploaded(a).unwrap());
    assert!(q.mark_photo_uploaded(a).unwrap());
    let pending = q.pending_photos().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, b);

    // photos do not count towards the mutation queue depth
    assert_eq!(q.count().unwrap(), 0);
  }

  #[test]
  fn test_abandoned_photo_goes_to_dead_letters() {
    let q = queue();
    let a = q
      .enqueue_photo(&[9; 16], "image/jpeg", &json!({"visita": "v7"}))
      .unwrap();
    assert_eq!(q.record_photo_failure(a, "503").unwrap(), 1);
    q.abandon_photo(a, "503").unwrap();

    assert!(q.pending_photos().unwrap().is_empty());
    let letters = q.dead_letters().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].source, DeadLetterSource::Photo);
    assert_eq!(letters[0].kind, "upload");
    assert_eq!(letters[0].collection, format!("photos/{}", a));
    assert_eq!(letters[0].payload, json!({"visita": "v7"}));

    let b = q
      .enqueue_photo(&[1], "image/jpeg", &json!({"path": "visitas/v7/b.jpg"}))
      .unwrap();
    q.abandon_photo(b, "403").unwrap();
    let letter = q
      .dead_letters()
      .unwrap()
      .into_iter()
      .find(|l| l.item_id == b)
      .unwrap();
    assert_eq!(letter.collection, "visitas/v7/b.jpg");
  }

  #[test]
  fn test_compact_drops_finished_photo_blobs() {
    let q = queue();
    let done = q
      .enqueue_photo(&vec![7; 1_000_000], "image/jpeg", &json!({}))
      .unwrap();
    let gone = q.enqueue_photo(&[8; 64], "image/jpeg", &json!({})).unwrap();
    let waiting = q.enqueue_photo(&[9; 32], "image/jpeg", &json!({})).unwrap();
    q.mark_photo_uploaded(done).unwrap();
    q.abandon_photo(gone, "rejected").unwrap();

    // a pending mutation holds back queue compaction, not photo cleanup
    q.enqueue(MutationKind::Create, "tareas", &json!({})).unwrap();
    assert_eq!(q.compact().unwrap(), 2);

    assert_eq!(q.photo_bytes().unwrap(), 32);
    let pending = q.pending_photos().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, waiting);
    assert_eq!(q.dead_letters().unwrap().len(), 1);
  }
}
