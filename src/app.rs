use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::commands::{Command, GatewayCommand, ProfileCommand};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ConnectivityProbe};
use crate::db::Database;
use crate::event::{Event, EventHandler};
use crate::gateway::{CacheGateway, GatewayRequest, HttpFetcher, SqliteCacheStorage};
use crate::queue::{MutationKind, OfflineQueue};
use crate::remote::RestDocumentStore;
use crate::session::{AccountLookupProvider, Session, SessionCache};
use crate::sync::{DrainOutcome, SubmitOutcome, SyncEngine, SyncEvent, SyncScheduler};

/// Timeout for requests sent through the gateway
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

const GATEWAY_DB: &str = "sw-cache.db";

/// What a logout removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogoutSummary {
  pub profile_cleared: bool,
  pub mutations: usize,
  pub photos: usize,
  /// Remote API responses dropped from the gateway cache
  pub api_responses: usize,
}

/// Owns the offline services and wires them together per command
pub struct App {
  config: Config,
  data_dir: PathBuf,
  queue: OfflineQueue,
  session: SessionCache,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let db = Arc::new(Database::open(&data_dir.join("offline.db"))?);

    Ok(Self {
      queue: OfflineQueue::new(db.clone()),
      session: SessionCache::new(db),
      config,
      data_dir,
    })
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn session(&self) -> &SessionCache {
    &self.session
  }

  pub async fn execute(&self, command: Command) -> Result<()> {
    match command {
      Command::Enqueue {
        kind,
        collection,
        payload,
      } => {
        let kind = MutationKind::from(kind);
        let id = self.queue.enqueue(kind, &collection, &parse_json(&payload)?)?;
        println!("queued {} on {} as #{}", kind, collection, id);
      }
      Command::EnqueuePhoto {
        file,
        content_type,
        metadata,
      } => {
        let blob = std::fs::read(&file)
          .map_err(|e| eyre!("Failed to read photo {}: {}", file.display(), e))?;
        let metadata = match metadata {
          Some(raw) => parse_json(&raw)?,
          None => Value::Object(Default::default()),
        };
        let id = self.queue.enqueue_photo(&blob, &content_type, &metadata)?;
        println!("queued photo #{} ({} bytes)", id, blob.len());
      }
      Command::Submit {
        kind,
        collection,
        payload,
        assume_online,
      } => {
        let outcome = self
          .submit(kind.into(), &collection, parse_json(&payload)?, assume_online)
          .await?;
        match outcome {
          SubmitOutcome::Applied { remote_id } => {
            println!("applied{}", remote_id.map(|id| format!(" as {}", id)).unwrap_or_default())
          }
          SubmitOutcome::Queued { id } => println!("queued as #{}", id),
        }
      }
      Command::Pending => {
        for item in self.queue.list_pending()? {
          println!(
            "#{}\t{}\t{}\tattempts={}\t{}",
            item.id,
            item.kind,
            item.collection,
            item.sync_attempts,
            item.created_at.to_rfc3339()
          );
        }
        let photos = self.queue.pending_photos()?;
        if !photos.is_empty() {
          println!(
            "{} photo(s) waiting for upload, {} bytes stored",
            photos.len(),
            self.queue.photo_bytes()?
          );
        }
      }
      Command::Count => println!("{}", self.queue.count()?),
      Command::Sync { assume_online } => {
        let outcome = self.sync_once(assume_online).await?;
        match outcome {
          DrainOutcome::Completed(report) => println!(
            "synced {} item(s), {} abandoned, {} retrying, {} photo(s) uploaded",
            report.processed, report.failed, report.retrying, report.photos_uploaded
          ),
          DrainOutcome::Offline => println!("offline, nothing sent"),
          DrainOutcome::Coalesced => println!("another drain is running"),
        }
      }
      Command::Run => self.run().await?,
      Command::DeadLetters { clear } => {
        if clear {
          println!("removed {} dead letter(s)", self.queue.clear_dead_letters()?);
        } else {
          for letter in self.queue.dead_letters()? {
            println!(
              "#{}\t{}\t{}\t{}\t{}\tattempts={}\t{}",
              letter.item_id,
              letter.source.as_str(),
              letter.collection,
              letter.kind,
              letter.failed_at.to_rfc3339(),
              letter.attempts,
              letter.error
            );
          }
        }
      }
      Command::Logout => {
        let summary = self.logout()?;
        println!(
          "logged out: {} mutation(s), {} photo(s) and {} cached API response(s) discarded",
          summary.mutations, summary.photos, summary.api_responses
        );
      }
      Command::Profile { action } => match action {
        ProfileCommand::Show => match self.session.load()? {
          Some(profile) => println!(
            "{}",
            serde_json::to_string_pretty(&profile)
              .map_err(|e| eyre!("Failed to serialize profile: {}", e))?
          ),
          None => println!("no stored profile"),
        },
        ProfileCommand::Clear => {
          self.session.clear()?;
        }
      },
      Command::Gateway { action } => self.gateway_command(action).await?,
    }

    Ok(())
  }

  /// Identity for the current command: live when the provider answers,
  /// otherwise whatever profile is stored.
  pub async fn current_session(&self) -> Result<Session> {
    match AccountLookupProvider::from_config(&self.config) {
      Ok(Some(provider)) => self.session.resolve(&provider).await,
      Ok(None) => self.stored_session(),
      Err(e) => {
        warn!(error = %e, "Identity provider unavailable, using stored profile");
        self.stored_session()
      }
    }
  }

  fn stored_session(&self) -> Result<Session> {
    Ok(match self.session.load()? {
      Some(profile) => Session::Offline(profile),
      None => Session::SignedOut,
    })
  }

  /// Write through the engine when the session allows it, otherwise queue.
  ///
  /// Queued writes never need the remote store, so a missing credential
  /// cannot lose them.
  pub async fn submit(
    &self,
    kind: MutationKind,
    collection: &str,
    payload: Value,
    assume_online: bool,
  ) -> Result<SubmitOutcome> {
    let session = self.current_session().await?;
    if !session.can_write_remote() {
      debug!(trust = ?session.trust(), "No live session, queueing write");
      return self.queue_write(kind, collection, &payload);
    }

    let monitor = self.monitor(assume_online).await?;
    match self.sync_engine(&monitor) {
      Ok(engine) => engine.submit(kind, collection, payload).await,
      Err(e) => {
        warn!(error = %e, "Remote store unavailable, queueing write");
        self.queue_write(kind, collection, &payload)
      }
    }
  }

  fn queue_write(
    &self,
    kind: MutationKind,
    collection: &str,
    payload: &Value,
  ) -> Result<SubmitOutcome> {
    let id = self.queue.enqueue(kind, collection, payload)?;
    Ok(SubmitOutcome::Queued { id })
  }

  pub async fn sync_once(&self, assume_online: bool) -> Result<DrainOutcome> {
    let monitor = self.monitor(assume_online).await?;
    let engine = self.sync_engine(&monitor)?;
    engine.flush().await
  }

  /// Forget the user: stored profile, every queued mutation and photo, and
  /// any remote API data the gateway cached for them.
  pub fn logout(&self) -> Result<LogoutSummary> {
    let cache_path = self.data_dir.join(GATEWAY_DB);
    let api_responses = if cache_path.exists() {
      self.gateway()?.forget_api_responses()?
    } else {
      0
    };

    let summary = LogoutSummary {
      profile_cleared: self.session.clear()?,
      mutations: self.queue.clear()?,
      photos: self.queue.clear_photos()?,
      api_responses,
    };
    info!(
      mutations = summary.mutations,
      photos = summary.photos,
      api_responses = summary.api_responses,
      "Logged out, offline data cleared"
    );
    Ok(summary)
  }

  /// Long-running agent until Ctrl-C.
  pub async fn run(&self) -> Result<()> {
    let probe = ConnectivityProbe::from_config(&self.config.connectivity)?;
    let online = match &probe {
      Some(probe) => probe.check().await,
      None => {
        info!("No probe_url configured, assuming online");
        true
      }
    };
    let monitor = Arc::new(ConnectivityMonitor::new(online));
    let engine = self.sync_engine(&monitor)?;
    let provider = AccountLookupProvider::from_config(&self.config)?.map(Arc::new);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut events = EventHandler::new(engine.subscribe(), monitor.subscribe());
    let mut tasks = Vec::new();

    if let Some(probe) = probe {
      tasks.push(tokio::spawn(probe.run(monitor.clone(), shutdown_rx.clone())));
    }
    tasks.push(tokio::spawn(
      SyncScheduler::new(engine.clone(), self.config.sync.poll_interval()).run(shutdown_rx.clone()),
    ));
    if let Some(provider) = provider {
      tasks.push(tokio::spawn(provider.clone().run(shutdown_rx.clone())));

      let session = self.session.clone();
      let shutdown = shutdown_rx.clone();
      tasks.push(tokio::spawn(async move {
        if let Err(e) = session.mirror(provider.as_ref(), shutdown).await {
          error!(error = %e, "Identity mirror failed");
        }
      }));
    }

    // anything queued while the agent was down
    if let Err(e) = engine.drain().await {
      error!(error = %e, "Startup drain failed");
    }
    info!(online, pending = self.queue.count()?, "Agent running");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
      tokio::select! {
        result = &mut ctrl_c => {
          if let Err(e) = result {
            error!(error = %e, "Failed to listen for Ctrl-C");
          }
          info!("Shutting down");
          break;
        }
        event = events.next() => match event {
          Some(event) => log_event(&event),
          None => break,
        }
      }
    }

    shutdown_tx.send_replace(true);
    for task in tasks {
      if let Err(e) = task.await {
        warn!(error = %e, "Background task ended abnormally");
      }
    }
    Ok(())
  }

  async fn monitor(&self, assume_online: bool) -> Result<Arc<ConnectivityMonitor>> {
    let online = if assume_online {
      true
    } else {
      match ConnectivityProbe::from_config(&self.config.connectivity)? {
        Some(probe) => probe.check().await,
        None => {
          warn!("No probe_url configured; pass --assume-online to sync without one");
          false
        }
      }
    };
    Ok(Arc::new(ConnectivityMonitor::new(online)))
  }

  /// Engine on the shared queue, registered as the monitor's restore hook.
  fn sync_engine(&self, monitor: &ConnectivityMonitor) -> Result<Arc<SyncEngine>> {
    let remote = Arc::new(RestDocumentStore::from_config(&self.config)?);
    let engine = Arc::new(SyncEngine::new(
      self.queue.clone(),
      remote,
      monitor.liveness(),
      self.config.sync.clone(),
    ));
    monitor.set_restore_hook(engine.clone())?;
    Ok(engine)
  }

  fn gateway(&self) -> Result<CacheGateway<SqliteCacheStorage, HttpFetcher>> {
    let storage = SqliteCacheStorage::open(&self.data_dir.join(GATEWAY_DB))?;
    let fetcher = HttpFetcher::new(GATEWAY_TIMEOUT)?;
    CacheGateway::new(storage, fetcher, self.config.gateway.clone())
  }

  async fn gateway_command(&self, action: GatewayCommand) -> Result<()> {
    let gateway = self.gateway()?;

    match action {
      GatewayCommand::Install => {
        let assets = gateway.install().await?;
        println!("installed {} with {} asset(s)", gateway.cache_name(), assets);
      }
      GatewayCommand::Activate => print_purged(&gateway.cache_name(), &gateway.activate()?),
      GatewayCommand::Deploy => print_purged(&gateway.cache_name(), &gateway.deploy().await?),
      GatewayCommand::Fetch { url, navigate } => {
        let url = gateway.resolve(&url)?;
        let request = if navigate {
          GatewayRequest::navigate(url)
        } else {
          GatewayRequest::get(url)
        };

        let answer = gateway.handle(&request).await?;
        eprintln!(
          "{} ({:?}, {:?})",
          answer.response.status,
          answer.source,
          gateway.policy().classify(&request)
        );
        println!("{}", String::from_utf8_lossy(&answer.response.body));
      }
      GatewayCommand::Caches => {
        let active = gateway.active_cache()?;
        for name in gateway.caches()? {
          let marker = if active.as_deref() == Some(name.as_str()) {
            "*"
          } else {
            " "
          };
          println!("{} {}", marker, name);
        }
      }
    }

    Ok(())
  }
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON payload: {}", e))
}

fn print_purged(cache: &str, purged: &[String]) {
  println!("activated {}", cache);
  for name in purged {
    println!("deleted {}", name);
  }
}

fn log_event(event: &Event) {
  match event {
    Event::Sync(sync) => match sync {
      SyncEvent::QueueDepth { pending } => debug!(pending = *pending, "Queue depth"),
      SyncEvent::ItemAbandoned {
        item_id,
        collection,
        attempts,
        ..
      } => warn!(item_id = *item_id, collection = %collection, attempts = *attempts, "{}", sync.message()),
      _ => info!("{}", sync.message()),
    },
    Event::Connectivity(change) => debug!(?change, "Connectivity changed"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::gateway::{CacheStorage, CachedResponse, RequestKey};
  use crate::session::LocalProfile;
  use serde_json::json;
  use url::Url;

  fn app(dir: &std::path::Path) -> App {
    let config = Config {
      data_dir: Some(dir.to_path_buf()),
      ..Config::default()
    };
    App::new(config).unwrap()
  }

  #[test]
  fn test_logout_clears_profile_and_queue() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());

    app
      .session()
      .save(&LocalProfile::new("u1", "a@b.com"))
      .unwrap();
    app
      .queue()
      .enqueue(MutationKind::Create, "tareas", &json!({"titulo": "x"}))
      .unwrap();
    app
      .queue()
      .enqueue_photo(b"jpeg", "image/jpeg", &json!({}))
      .unwrap();

    let summary = app.logout().unwrap();
    assert_eq!(
      summary,
      LogoutSummary {
        profile_cleared: true,
        mutations: 1,
        photos: 1,
        api_responses: 0,
      }
    );
    assert_eq!(app.queue().count().unwrap(), 0);
    assert_eq!(app.session().load().unwrap(), None);
  }

  #[test]
  fn test_logout_drops_cached_api_responses() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());

    let storage = SqliteCacheStorage::open(&dir.path().join(GATEWAY_DB)).unwrap();
    let api = Url::parse("https://firestore.googleapis.com/v1/documents/tareas?uid=u1").unwrap();
    let page = Url::parse("http://localhost:8080/menu.html").unwrap();
    for target in [&api, &page] {
      storage
        .put("geopoint-v4", &RequestKey::new("GET", target), &CachedResponse::new(200, "x"))
        .unwrap();
    }
    drop(storage);

    let summary = app.logout().unwrap();
    assert_eq!(summary.api_responses, 1);

    let storage = SqliteCacheStorage::open(&dir.path().join(GATEWAY_DB)).unwrap();
    let lookup = |url: &Url| {
      storage
        .lookup("geopoint-v4", &RequestKey::new("GET", url), false)
        .unwrap()
    };
    assert!(lookup(&api).is_none());
    assert!(lookup(&page).is_some());
  }

  #[tokio::test]
  async fn test_session_without_provider_uses_stored_profile() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path());
    assert_eq!(app.current_session().await.unwrap(), Session::SignedOut);

    let profile = LocalProfile::new("u1", "a@b.com");
    app.session().save(&profile).unwrap();
    let session = app.current_session().await.unwrap();
    assert_eq!(session, Session::Offline(profile));
    assert!(!session.can_write_remote());
  }

  #[tokio::test]
  async fn test_submit_without_live_session_queues_without_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config {
      data_dir: Some(dir.path().to_path_buf()),
      ..Config::default()
    };
    // a provider that cannot be built must not block the write either
    config.auth.lookup_url = Some("http://127.0.0.1:9/lookup".to_string());
    let app = App::new(config).unwrap();
    app
      .session()
      .save(&LocalProfile::new("u1", "a@b.com"))
      .unwrap();

    let payload = json!({"cliente": "X", "estado": "pendiente"});
    let outcome = app
      .submit(MutationKind::Create, "tareas", payload.clone(), true)
      .await
      .unwrap();

    let SubmitOutcome::Queued { id } = outcome else {
      panic!("expected a queued write, got {:?}", outcome);
    };
    let item = app.queue().get(id).unwrap().unwrap();
    assert_eq!(item.collection, "tareas");
    assert_eq!(item.payload, payload);
    assert_eq!(app.queue().count().unwrap(), 1);
  }

  #[test]
  fn test_queue_survives_app_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
      let app = app(dir.path());
      app
        .queue()
        .enqueue(MutationKind::Update, "tareas", &json!({"id": "t1"}))
        .unwrap();
    }
    let app = app(dir.path());
    assert_eq!(app.queue().count().unwrap(), 1);
  }
}
