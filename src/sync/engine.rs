//! Queue drain state machine.
//!
//! The engine is either `Idle` or `Draining`. A trigger (reconnect, timer
//! tick, explicit flush) moves it to `Draining` and replays every pending
//! item in queue order. A trigger that arrives mid-drain does not start a
//! second loop: it is recorded and answered with one follow-up pass once the
//! current pass ends, so no item is ever dispatched twice concurrently.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::events::SyncEvent;
use crate::config::{SyncConfig, WritePolicy};
use crate::connectivity::{Liveness, RestoreHook};
use crate::queue::{MutationKind, OfflineQueue, QueueItem};
use crate::remote::{document_id, RemoteError, RemoteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPhase {
  Idle,
  Draining,
}

#[derive(Debug)]
struct DrainState {
  phase: DrainPhase,
  /// A trigger arrived while draining
  rerun: bool,
}

/// Tally of one drain (all of its passes).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Mutations applied remotely
  pub processed: usize,
  /// Items abandoned (mutations and photos)
  pub failed: usize,
  /// Items that failed but stay queued for the next trigger
  pub retrying: usize,
  pub photos_uploaded: usize,
  pub passes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
  /// The liveness flag was down; nothing was attempted
  Offline,
  /// Another drain was running; it will do one more pass
  Coalesced,
  Completed(DrainReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
  /// Written straight to the remote store
  Applied { remote_id: Option<String> },
  /// Persisted in the offline queue
  Queued { id: i64 },
}

pub struct SyncEngine {
  queue: OfflineQueue,
  remote: Arc<dyn RemoteStore>,
  liveness: Liveness,
  config: SyncConfig,
  state: Mutex<DrainState>,
  events: broadcast::Sender<SyncEvent>,
}

/// Returns the engine to `Idle` if a drain exits early (error or offline).
struct DrainGuard<'a> {
  engine: &'a SyncEngine,
  armed: bool,
}

impl DrainGuard<'_> {
  /// Either consume a pending rerun request or go idle.
  fn next_pass(&mut self) -> Result<bool> {
    let mut state = self.engine.state()?;
    if state.rerun {
      state.rerun = false;
      return Ok(true);
    }
    state.phase = DrainPhase::Idle;
    self.armed = false;
    Ok(false)
  }
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    if let Ok(mut state) = self.engine.state.lock() {
      state.phase = DrainPhase::Idle;
      state.rerun = false;
    }
  }
}

impl SyncEngine {
  pub fn new(
    queue: OfflineQueue,
    remote: Arc<dyn RemoteStore>,
    liveness: Liveness,
    config: SyncConfig,
  ) -> Self {
    let (events, _) = broadcast::channel(64);
    Self {
      queue,
      remote,
      liveness,
      config,
      state: Mutex::new(DrainState {
        phase: DrainPhase::Idle,
        rerun: false,
      }),
      events,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn phase(&self) -> Result<DrainPhase> {
    Ok(self.state()?.phase)
  }

  fn state(&self) -> Result<MutexGuard<'_, DrainState>> {
    self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn emit(&self, event: SyncEvent) {
    // nobody listening is fine
    let _ = self.events.send(event);
  }

  fn emit_depth(&self) -> Result<()> {
    let pending = self.queue.count()?;
    self.emit(SyncEvent::QueueDepth { pending });
    Ok(())
  }

  /// Write now if possible, otherwise persist in the queue.
  ///
  /// A direct write is only attempted while online, idle and with an empty
  /// queue, so it can never overtake an earlier queued edit. Transient
  /// failures fall back to the queue; permanent rejections go to the caller.
  pub async fn submit(
    &self,
    kind: MutationKind,
    collection: &str,
    payload: Value,
  ) -> Result<SubmitOutcome> {
    if self.can_apply_directly()? {
      match self.apply(kind, collection, &payload).await {
        Ok(remote_id) => {
          debug!(%kind, collection, "Mutation applied directly");
          return Ok(SubmitOutcome::Applied { remote_id });
        }
        Err(e) if e.is_permanent() => {
          return Err(eyre!("Remote store rejected {} on {}: {}", kind, collection, e));
        }
        Err(e) => {
          warn!(%kind, collection, error = %e, "Direct write failed, queueing");
        }
      }
    }

    let id = self.enqueue(kind, collection, &payload)?;
    Ok(SubmitOutcome::Queued { id })
  }

  /// Persist a mutation for the next drain without trying the remote store.
  pub fn enqueue(&self, kind: MutationKind, collection: &str, payload: &Value) -> Result<i64> {
    let id = self.queue.enqueue(kind, collection, payload)?;
    self.emit_depth()?;
    Ok(id)
  }

  fn can_apply_directly(&self) -> Result<bool> {
    Ok(
      self.config.write_policy == WritePolicy::QueueWhenOffline
        && self.liveness.is_online()
        && self.phase()? == DrainPhase::Idle
        && self.queue.count()? == 0,
    )
  }

  /// Explicit user-requested sync.
  pub async fn flush(&self) -> Result<DrainOutcome> {
    info!("Manual sync requested");
    self.drain().await
  }

  /// Run one drain: every pending mutation, then every pending photo.
  pub async fn drain(&self) -> Result<DrainOutcome> {
    if !self.liveness.is_online() {
      debug!("Offline, drain skipped");
      return Ok(DrainOutcome::Offline);
    }

    let Some(mut guard) = self.begin_drain()? else {
      debug!("Drain in flight, trigger coalesced");
      return Ok(DrainOutcome::Coalesced);
    };

    let mut report = DrainReport::default();
    loop {
      self.run_pass(&mut report).await?;
      report.passes += 1;

      if !self.liveness.is_online() || !guard.next_pass()? {
        break;
      }
      debug!("Running follow-up pass");
    }
    drop(guard);

    if self.config.compact_after_drain {
      self.queue.compact()?;
    }
    self.emit_summary(&report);
    self.emit_depth()?;

    info!(
      processed = report.processed,
      failed = report.failed,
      retrying = report.retrying,
      photos = report.photos_uploaded,
      "Drain finished"
    );
    Ok(DrainOutcome::Completed(report))
  }

  fn begin_drain(&self) -> Result<Option<DrainGuard<'_>>> {
    let mut state = self.state()?;
    match state.phase {
      DrainPhase::Draining => {
        state.rerun = true;
        Ok(None)
      }
      DrainPhase::Idle => {
        state.phase = DrainPhase::Draining;
        Ok(Some(DrainGuard {
          engine: self,
          armed: true,
        }))
      }
    }
  }

  async fn run_pass(&self, report: &mut DrainReport) -> Result<()> {
    let items = self.queue.list_pending()?;
    if !items.is_empty() {
      info!(count = items.len(), "Syncing queued mutations");
    }

    for item in items {
      if !self.liveness.is_online() {
        warn!("Connection lost mid-drain, remaining items stay queued");
        return Ok(());
      }

      match self.apply(item.kind, &item.collection, &item.payload).await {
        Ok(_) => {
          self.queue.mark_synced(item.id)?;
          report.processed += 1;
          debug!(item_id = item.id, collection = %item.collection, "Mutation synced");
        }
        Err(err) => self.handle_failure(&item, &err, report)?,
      }
    }

    self.upload_photos(report).await
  }

  async fn upload_photos(&self, report: &mut DrainReport) -> Result<()> {
    for photo in self.queue.pending_photos()? {
      if !self.liveness.is_online() {
        return Ok(());
      }

      let path = photo.upload_path();
      match self
        .remote
        .upload_object(&path, &photo.blob, &photo.content_type)
        .await
      {
        Ok(()) => {
          self.queue.mark_photo_uploaded(photo.id)?;
          report.photos_uploaded += 1;
        }
        Err(err) => {
          let message = err.to_string();
          let attempts = self.queue.record_photo_failure(photo.id, &message)?;
          if self.should_abandon(attempts, &err) {
            self.queue.abandon_photo(photo.id, &message)?;
            report.failed += 1;
            self.emit(SyncEvent::ItemAbandoned {
              item_id: photo.id,
              collection: path,
              error: message,
              attempts,
            });
          } else {
            report.retrying += 1;
            debug!(photo_id = photo.id, attempts, error = %err, "Photo upload failed, will retry");
          }
        }
      }
    }
    Ok(())
  }

  fn handle_failure(
    &self,
    item: &QueueItem,
    err: &RemoteError,
    report: &mut DrainReport,
  ) -> Result<()> {
    let message = err.to_string();
    let attempts = self.queue.record_failure(item.id, &message)?;

    if self.should_abandon(attempts, err) {
      self.queue.abandon(item.id, &message)?;
      report.failed += 1;
      error!(item_id = item.id, collection = %item.collection, attempts, error = %err, "Giving up on mutation");
      self.emit(SyncEvent::ItemAbandoned {
        item_id: item.id,
        collection: item.collection.clone(),
        error: message,
        attempts,
      });
    } else {
      report.retrying += 1;
      debug!(item_id = item.id, attempts, error = %err, "Mutation failed, will retry");
    }
    Ok(())
  }

  fn should_abandon(&self, attempts: u32, err: &RemoteError) -> bool {
    attempts >= self.config.max_attempts || (self.config.fail_fast_permanent && err.is_permanent())
  }

  fn emit_summary(&self, report: &DrainReport) {
    if report.failed > 0 {
      self.emit(SyncEvent::PartialFailure {
        processed: report.processed,
        failed: report.failed,
      });
    } else if report.processed > 0 {
      self.emit(SyncEvent::Synced {
        processed: report.processed,
      });
    }
  }

  /// Translate one mutation into its remote call.
  async fn apply(
    &self,
    kind: MutationKind,
    collection: &str,
    payload: &Value,
  ) -> Result<Option<String>, RemoteError> {
    match kind {
      MutationKind::Create => {
        let record = self.stamp(payload)?;
        self.remote.insert(collection, &record).await
      }
      MutationKind::Update => {
        let id = document_id(payload)?;
        let partial = self.stamp(payload)?;
        self.remote.merge(collection, id, &partial).await?;
        Ok(None)
      }
      MutationKind::Delete => {
        let id = document_id(payload)?;
        self.remote.delete(collection, id).await?;
        Ok(None)
      }
    }
  }

  fn stamp(&self, payload: &Value) -> Result<Value, RemoteError> {
    let Value::Object(map) = payload else {
      return Err(RemoteError::invalid_payload("record payload must be a JSON object"));
    };

    let mut record = map.clone();
    if self.config.stamp_synced_at {
      record.insert("syncedAt".to_string(), Value::String(Utc::now().to_rfc3339()));
    }
    Ok(Value::Object(record))
  }
}

#[async_trait]
impl RestoreHook for SyncEngine {
  async fn connectivity_restored(&self) {
    match self.drain().await {
      Ok(outcome) => debug!(?outcome, "Reconnect drain done"),
      Err(e) => error!(error = %e, "Reconnect drain failed"),
    }
  }
}
