use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::connectivity::ConnectivityChange;
use crate::sync::SyncEvent;

/// Agent events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// Notification from the sync engine
  Sync(SyncEvent),
  /// Online/offline transition
  Connectivity(ConnectivityChange),
}

/// Merges the engine and connectivity broadcasts into one stream
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new(
    sync: broadcast::Receiver<SyncEvent>,
    connectivity: broadcast::Receiver<ConnectivityChange>,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    forward(sync, tx.clone(), Event::Sync);
    forward(connectivity, tx, Event::Connectivity);

    Self { rx }
  }

  /// Receive the next event; `None` once every source has closed
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

fn forward<T>(
  mut source: broadcast::Receiver<T>,
  tx: mpsc::UnboundedSender<Event>,
  wrap: fn(T) -> Event,
) where
  T: Clone + Send + 'static,
{
  tokio::spawn(async move {
    loop {
      match source.recv().await {
        Ok(value) => {
          if tx.send(wrap(value)).is_err() {
            break;
          }
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          warn!(skipped, "Event listener lagged");
        }
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  });
}
