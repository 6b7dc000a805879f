//! Diagnostics for items the sync engine gave up on.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::Row;
use serde::Serialize;
use serde_json::Value;

use super::{conversion_error, parse_timestamp, OfflineQueue};

/// Which store an abandoned item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterSource {
  Mutation,
  Photo,
}

impl DeadLetterSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Mutation => "mutation",
      Self::Photo => "photo",
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
  pub id: i64,
  pub source: DeadLetterSource,
  /// Id of the abandoned item in its own store
  pub item_id: i64,
  pub collection: String,
  pub kind: String,
  pub payload: Value,
  pub error: String,
  pub attempts: u32,
  pub failed_at: DateTime<Utc>,
}

impl OfflineQueue {
  /// Abandoned items, oldest first.
  pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, source, item_id, collection, kind, payload, error, attempts, failed_at
         FROM dead_letter ORDER BY id ASC",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let letters = stmt
      .query_map([], row_to_dead_letter)
      .map_err(|e| eyre!("Failed to query dead letters: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read dead letter: {}", e))?;

    Ok(letters)
  }

  pub fn clear_dead_letters(&self) -> Result<usize> {
    let conn = self.db.lock()?;
    conn
      .execute("DELETE FROM dead_letter", [])
      .map_err(|e| eyre!("Failed to clear dead letters: {}", e))
  }
}

fn row_to_dead_letter(row: &Row<'_>) -> rusqlite::Result<DeadLetter> {
  let source: String = row.get(1)?;
  let payload: String = row.get(5)?;
  let failed_at: String = row.get(8)?;

  Ok(DeadLetter {
    id: row.get(0)?,
    source: if source == "photo" {
      DeadLetterSource::Photo
    } else {
      DeadLetterSource::Mutation
    },
    item_id: row.get(2)?,
    collection: row.get(3)?,
    kind: row.get(4)?,
    payload: serde_json::from_str(&payload).map_err(|e| conversion_error(5, e))?,
    error: row.get(6)?,
    attempts: row.get(7)?,
    failed_at: parse_timestamp(8, &failed_at)?,
  })
}
