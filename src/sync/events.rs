use serde::Serialize;

/// User-visible signals emitted by the sync engine.
///
/// Transient retries are not reported; only outcomes worth a notification
/// are broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
  /// Current number of pending mutations
  QueueDepth { pending: u64 },
  /// A drain finished without abandoning anything
  Synced { processed: usize },
  /// A drain abandoned at least one item
  PartialFailure { processed: usize, failed: usize },
  /// One item will not be retried again
  ItemAbandoned {
    item_id: i64,
    collection: String,
    error: String,
    attempts: u32,
  },
}

impl SyncEvent {
  /// Short human-readable text for notifications.
  pub fn message(&self) -> String {
    match self {
      Self::QueueDepth { pending } => format!("{} pending", pending),
      Self::Synced { processed } => format!("Data synced ({} items)", processed),
      Self::PartialFailure { processed, failed } => {
        format!("Synced {} items, {} could not be synced", processed, failed)
      }
      Self::ItemAbandoned {
        collection, error, ..
      } => format!("Could not sync {} record: {}", collection, error),
    }
  }
}
