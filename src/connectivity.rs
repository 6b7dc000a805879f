//! Online/offline state, edge-triggered.
//!
//! [`ConnectivityMonitor`] is the single source of truth for whether the app
//! can reach the network. Subscribers hear about transitions only, never about
//! individual probe results. On a transition to online the restore hook (the
//! sync engine) runs before subscribers are told, so anything they render
//! already reflects the drain. The flag itself flips as soon as a report
//! arrives; going offline never waits for a restore in flight.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::config::ConnectivityConfig;

/// Read-only view of the online flag, shared with whoever needs to check it.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
  pub fn new(online: bool) -> Self {
    Self(Arc::new(AtomicBool::new(online)))
  }

  pub fn is_online(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }

  fn swap(&self, online: bool) -> bool {
    self.0.swap(online, Ordering::SeqCst)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityChange {
  Online,
  Offline,
}

/// Work that must finish before subscribers hear that the network is back.
#[async_trait]
pub trait RestoreHook: Send + Sync {
  async fn connectivity_restored(&self);
}

/// Result of flipping the online flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
  Unchanged,
  /// Carries the epoch of this online edge
  WentOnline(u64),
  WentOffline,
}

#[derive(Debug, Default)]
struct TransitionState {
  /// Bumped on every online edge
  epoch: u64,
  /// Epoch of the online edge whose restore hook has not finished yet
  restoring: Option<u64>,
}

pub struct ConnectivityMonitor {
  liveness: Liveness,
  hook: RwLock<Option<Arc<dyn RestoreHook>>>,
  changes: broadcast::Sender<ConnectivityChange>,
  /// Serializes flag flips; never held across the restore hook
  transition: Mutex<TransitionState>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (changes, _) = broadcast::channel(16);
    Self {
      liveness: Liveness::new(initially_online),
      hook: RwLock::new(None),
      changes,
      transition: Mutex::new(TransitionState::default()),
    }
  }

  pub fn is_online(&self) -> bool {
    self.liveness.is_online()
  }

  pub fn liveness(&self) -> Liveness {
    self.liveness.clone()
  }

  /// Install the hook run on every offline → online transition.
  pub fn set_restore_hook(&self, hook: Arc<dyn RestoreHook>) -> Result<()> {
    let mut slot = self
      .hook
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *slot = Some(hook);
    Ok(())
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityChange> {
    self.changes.subscribe()
  }

  /// Report the current network state. Returns `true` if this was a transition.
  ///
  /// An online edge returns once the restore hook has run.
  pub async fn report(&self, online: bool) -> bool {
    match self.flip(online).await {
      Transition::Unchanged => false,
      Transition::WentOnline(epoch) => {
        self.finish_restore(epoch).await;
        true
      }
      Transition::WentOffline => true,
    }
  }

  /// Like [`report`](Self::report), but an online edge runs the restore hook
  /// on its own task so the caller can keep reporting.
  pub async fn report_detached(self: &Arc<Self>, online: bool) -> Option<JoinHandle<()>> {
    let Transition::WentOnline(epoch) = self.flip(online).await else {
      return None;
    };
    let monitor = Arc::clone(self);
    Some(tokio::spawn(async move { monitor.finish_restore(epoch).await }))
  }

  async fn flip(&self, online: bool) -> Transition {
    let mut state = self.transition.lock().await;

    if self.liveness.swap(online) == online {
      return Transition::Unchanged;
    }

    if online {
      info!("Connection restored");
      state.epoch += 1;
      state.restoring = Some(state.epoch);
      return Transition::WentOnline(state.epoch);
    }

    info!("Connection lost, working offline");
    if state.restoring.take().is_none() {
      // no subscribers is fine
      let _ = self.changes.send(ConnectivityChange::Offline);
    }
    Transition::WentOffline
  }

  /// Run the restore hook, then announce the online edge if it still holds.
  async fn finish_restore(&self, epoch: u64) {
    let hook = self.hook.read().ok().and_then(|h| h.clone());
    if let Some(hook) = hook {
      hook.connectivity_restored().await;
    }

    let mut state = self.transition.lock().await;
    if state.restoring != Some(epoch) {
      debug!(epoch, "Online edge superseded before restore finished");
      return;
    }
    state.restoring = None;
    let _ = self.changes.send(ConnectivityChange::Online);
  }
}

/// Periodic HEAD probe feeding a [`ConnectivityMonitor`].
pub struct ConnectivityProbe {
  client: reqwest::Client,
  url: Url,
  interval: Duration,
}

impl ConnectivityProbe {
  /// Build a probe, or `None` when no probe URL is configured.
  pub fn from_config(config: &ConnectivityConfig) -> Result<Option<Self>> {
    let Some(raw) = &config.probe_url else {
      return Ok(None);
    };

    let url = Url::parse(raw).map_err(|e| eyre!("Invalid probe_url {}: {}", raw, e))?;
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.probe_timeout_secs.max(1)))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Some(Self {
      client,
      url,
      interval: Duration::from_secs(config.probe_interval_secs.max(1)),
    }))
  }

  /// Any HTTP response counts as online; transport errors count as offline.
  pub async fn check(&self) -> bool {
    match self.client.head(self.url.clone()).send().await {
      Ok(response) => {
        debug!(status = %response.status(), "Connectivity probe answered");
        true
      }
      Err(e) => {
        debug!(error = %e, "Connectivity probe failed");
        false
      }
    }
  }

  /// Probe until `shutdown` flips to true.
  ///
  /// Restore drains run beside the probe loop, so a slow drain never stalls
  /// the next check.
  pub async fn run(self, monitor: Arc<ConnectivityMonitor>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut restoring: Vec<JoinHandle<()>> = Vec::new();

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let online = self.check().await;
          restoring.retain(|task| !task.is_finished());
          if let Some(task) = monitor.report_detached(online).await {
            restoring.push(task);
          }
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }

    // an interrupted drain leaves its remaining items queued
    for task in restoring {
      task.abort();
    }
    info!("Connectivity probe stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use tokio::sync::Notify;

  struct CountingHook {
    calls: AtomicUsize,
    liveness_seen: Liveness,
    saw_online: AtomicBool,
  }

  #[async_trait]
  impl RestoreHook for CountingHook {
    async fn connectivity_restored(&self) {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self
        .saw_online
        .store(self.liveness_seen.is_online(), Ordering::SeqCst);
    }
  }

  /// Blocks inside the restore until the test opens the gate.
  #[derive(Default)]
  struct GatedHook {
    entered: Notify,
    gate: Notify,
  }

  #[async_trait]
  impl RestoreHook for GatedHook {
    async fn connectivity_restored(&self) {
      self.entered.notify_one();
      self.gate.notified().await;
    }
  }

  #[tokio::test]
  async fn test_transitions_are_edge_triggered() {
    let monitor = ConnectivityMonitor::new(false);
    let mut rx = monitor.subscribe();

    assert!(!monitor.report(false).await);
    assert!(monitor.report(true).await);
    assert!(!monitor.report(true).await);
    assert!(!monitor.report(true).await);
    assert!(monitor.report(false).await);

    assert_eq!(rx.recv().await.unwrap(), ConnectivityChange::Online);
    assert_eq!(rx.recv().await.unwrap(), ConnectivityChange::Offline);
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_restore_hook_runs_before_subscribers() {
    let monitor = ConnectivityMonitor::new(false);
    let hook = Arc::new(CountingHook {
      calls: AtomicUsize::new(0),
      liveness_seen: monitor.liveness(),
      saw_online: AtomicBool::new(false),
    });
    monitor.set_restore_hook(hook.clone()).unwrap();
    let mut rx = monitor.subscribe();

    monitor.report(true).await;

    // the hook already ran, and saw the flag as online
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    assert!(hook.saw_online.load(Ordering::SeqCst));
    assert_eq!(rx.recv().await.unwrap(), ConnectivityChange::Online);

    monitor.report(true).await;
    monitor.report(false).await;
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_going_offline_does_not_wait_for_restore() {
    let monitor = Arc::new(ConnectivityMonitor::new(false));
    let hook = Arc::new(GatedHook::default());
    monitor.set_restore_hook(hook.clone()).unwrap();
    let mut rx = monitor.subscribe();

    let restore = monitor.report_detached(true).await.unwrap();
    hook.entered.notified().await;
    assert!(monitor.is_online());

    let went_offline = tokio::time::timeout(Duration::from_secs(1), monitor.report(false))
      .await
      .unwrap();
    assert!(went_offline);
    assert!(!monitor.is_online());

    hook.gate.notify_one();
    restore.await.unwrap();
    // the online edge was never announced, so the offline one is not either
    assert!(rx.try_recv().is_err());

    hook.gate.notify_one();
    assert!(monitor.report(true).await);
    assert_eq!(rx.recv().await.unwrap(), ConnectivityChange::Online);
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_report_detached_ignores_non_edges() {
    let monitor = Arc::new(ConnectivityMonitor::new(true));
    assert!(monitor.report_detached(true).await.is_none());
    assert!(monitor.report_detached(false).await.is_none());
    assert!(!monitor.is_online());

    let restore = monitor.report_detached(true).await.unwrap();
    restore.await.unwrap();
    assert!(monitor.is_online());
  }

  #[test]
  fn test_probe_requires_url() {
    let config = ConnectivityConfig::default();
    assert!(ConnectivityProbe::from_config(&config).unwrap().is_none());

    let config = ConnectivityConfig {
      probe_url: Some("https://example.com/ping".to_string()),
      ..ConnectivityConfig::default()
    };
    assert!(ConnectivityProbe::from_config(&config).unwrap().is_some());
  }
}
