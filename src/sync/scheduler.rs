//! Periodic drain trigger.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::engine::{DrainOutcome, SyncEngine};

/// Ticks the engine on a fixed interval until shutdown.
///
/// Ticks while offline or mid-drain are cheap: the engine returns
/// `Offline`/`Coalesced` without touching the queue.
pub struct SyncScheduler {
  engine: Arc<SyncEngine>,
  interval: Duration,
}

impl SyncScheduler {
  pub fn new(engine: Arc<SyncEngine>, interval: Duration) -> Self {
    Self { engine, interval }
  }

  pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately; skip it so startup does not race the probe
    ticker.tick().await;

    info!(interval_secs = self.interval.as_secs(), "Sync timer started");
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          match self.engine.drain().await {
            Ok(DrainOutcome::Completed(report)) => {
              debug!(processed = report.processed, "Timer drain done");
            }
            Ok(outcome) => debug!(?outcome, "Timer drain skipped"),
            Err(e) => error!(error = %e, "Timer drain failed"),
          }
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    info!("Sync timer stopped");
  }
}
