//! Last-known identity, kept locally so the app stays usable without live auth.
//!
//! The profile is a single row overwritten on every successful sign-in and
//! removed on sign-out or logout. A profile loaded while the identity
//! provider is unreachable is lower trust than a live one: it is good enough
//! to render the UI, not to write to the remote store directly.

pub mod provider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::queue::parse_timestamp;
use crate::remote::RemoteError;

pub use provider::AccountLookupProvider;

const PROFILE_KEY: &str = "current-user";

/// Signed-in user as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
  pub uid: String,
  pub email: String,
  pub display_name: Option<String>,
  pub client: Option<String>,
  pub unit: Option<String>,
}

/// Locally persisted copy of the last identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalProfile {
  pub uid: String,
  pub email: String,
  pub display_name: String,
  pub client: Option<String>,
  pub unit: Option<String>,
  pub saved_at: DateTime<Utc>,
}

impl LocalProfile {
  pub fn new(uid: impl Into<String>, email: impl Into<String>) -> Self {
    let email = email.into();
    Self {
      uid: uid.into(),
      display_name: default_display_name(&email),
      email,
      client: None,
      unit: None,
      saved_at: Utc::now(),
    }
  }

  pub fn from_identity(identity: &Identity) -> Self {
    Self {
      uid: identity.uid.clone(),
      email: identity.email.clone(),
      display_name: identity
        .display_name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| default_display_name(&identity.email)),
      client: identity.client.clone(),
      unit: identity.unit.clone(),
      saved_at: Utc::now(),
    }
  }
}

/// Local part of the email address.
fn default_display_name(email: &str) -> String {
  email.split('@').next().unwrap_or(email).to_string()
}

/// Source of the live identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
  /// `Ok(None)` means signed out; `Err` means the provider could not be asked.
  async fn current_identity(&self) -> Result<Option<Identity>, RemoteError>;

  /// Identity changes; the current value is the last known one.
  fn subscribe(&self) -> watch::Receiver<Option<Identity>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trust {
  None,
  /// Restored from the local profile
  Cached,
  /// Confirmed by the identity provider
  Verified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
  Live(LocalProfile),
  Offline(LocalProfile),
  SignedOut,
}

impl Session {
  pub fn trust(&self) -> Trust {
    match self {
      Self::Live(_) => Trust::Verified,
      Self::Offline(_) => Trust::Cached,
      Self::SignedOut => Trust::None,
    }
  }

  pub fn profile(&self) -> Option<&LocalProfile> {
    match self {
      Self::Live(p) | Self::Offline(p) => Some(p),
      Self::SignedOut => None,
    }
  }

  /// Protected views may render.
  pub fn is_authenticated(&self) -> bool {
    self.trust() >= Trust::Cached
  }

  /// Writes may go straight to the remote store; otherwise they are queued.
  pub fn can_write_remote(&self) -> bool {
    self.trust() == Trust::Verified
  }
}

/// Singleton profile store on the offline database.
#[derive(Clone)]
pub struct SessionCache {
  db: Arc<Database>,
}

impl SessionCache {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// Overwrite the stored profile.
  pub fn save(&self, profile: &LocalProfile) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO user_profile
           (key, uid, email, display_name, client, unit, saved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
          PROFILE_KEY,
          profile.uid,
          profile.email,
          profile.display_name,
          profile.client,
          profile.unit,
          profile.saved_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to save profile: {}", e))?;

    debug!(uid = %profile.uid, "Profile saved");
    Ok(())
  }

  pub fn load(&self) -> Result<Option<LocalProfile>> {
    let conn = self.db.lock()?;
    conn
      .query_row(
        "SELECT uid, email, display_name, client, unit, saved_at
         FROM user_profile WHERE key = ?1",
        [PROFILE_KEY],
        |row| {
          let saved_at: String = row.get(5)?;
          Ok(LocalProfile {
            uid: row.get(0)?,
            email: row.get(1)?,
            display_name: row.get(2)?,
            client: row.get(3)?,
            unit: row.get(4)?,
            saved_at: parse_timestamp(5, &saved_at)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to load profile: {}", e))
  }

  /// Remove the stored profile. Returns `false` if there was none.
  pub fn clear(&self) -> Result<bool> {
    let conn = self.db.lock()?;
    let removed = conn
      .execute("DELETE FROM user_profile WHERE key = ?1", [PROFILE_KEY])
      .map_err(|e| eyre!("Failed to clear profile: {}", e))?;
    Ok(removed > 0)
  }

  /// Ask the provider, falling back to the stored profile when it is unreachable.
  pub async fn resolve(&self, provider: &dyn IdentityProvider) -> Result<Session> {
    match provider.current_identity().await {
      Ok(Some(identity)) => {
        let profile = LocalProfile::from_identity(&identity);
        self.save(&profile)?;
        Ok(Session::Live(profile))
      }
      Ok(None) => Ok(Session::SignedOut),
      Err(e) => {
        warn!(error = %e, "Identity provider unreachable, using stored profile");
        Ok(match self.load()? {
          Some(profile) => Session::Offline(profile),
          None => Session::SignedOut,
        })
      }
    }
  }

  /// Keep the stored profile in step with the provider until shutdown.
  ///
  /// Every identity is saved. The profile is cleared only when a signed-in
  /// identity seen by this loop turns into a sign-out, so a provider that
  /// starts out empty does not wipe the offline fallback.
  pub async fn mirror(
    &self,
    provider: &dyn IdentityProvider,
    mut shutdown: watch::Receiver<bool>,
  ) -> Result<()> {
    let mut identities = provider.subscribe();
    let mut signed_in = false;

    info!("Identity mirror started");
    loop {
      let current = identities.borrow_and_update().clone();
      match current {
        Some(identity) => {
          self.save(&LocalProfile::from_identity(&identity))?;
          signed_in = true;
        }
        None if signed_in => {
          self.clear()?;
          signed_in = false;
          info!("Signed out, stored profile cleared");
        }
        None => {}
      }

      tokio::select! {
        changed = identities.changed() => {
          if changed.is_err() {
            break;
          }
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    info!("Identity mirror stopped");
    Ok(())
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};

  /// Identity provider driven by the test.
  pub struct FakeProvider {
    tx: watch::Sender<Option<Identity>>,
    reachable: AtomicBool,
  }

  impl FakeProvider {
    pub fn new(identity: Option<Identity>) -> Self {
      let (tx, _) = watch::channel(identity);
      Self {
        tx,
        reachable: AtomicBool::new(true),
      }
    }

    pub fn set_identity(&self, identity: Option<Identity>) {
      self.tx.send_replace(identity);
    }

    pub fn set_reachable(&self, reachable: bool) {
      self.reachable.store(reachable, Ordering::SeqCst);
    }
  }

  #[async_trait]
  impl IdentityProvider for FakeProvider {
    async fn current_identity(&self) -> Result<Option<Identity>, RemoteError> {
      if !self.reachable.load(Ordering::SeqCst) {
        return Err(RemoteError::Unreachable("auth offline".to_string()));
      }
      Ok(self.tx.borrow().clone())
    }

    fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
      self.tx.subscribe()
    }
  }

  pub fn identity(uid: &str, email: &str) -> Identity {
    Identity {
      uid: uid.to_string(),
      email: email.to_string(),
      display_name: None,
      client: None,
      unit: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::testing::{identity, FakeProvider};
  use super::*;
  use std::time::Duration;

  fn cache() -> SessionCache {
    SessionCache::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
      if cond() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
  }

  #[test]
  fn test_save_overwrites_singleton() {
    let cache = cache();
    assert_eq!(cache.load().unwrap(), None);

    cache.save(&LocalProfile::new("u1", "a@b.com")).unwrap();
    let mut second = LocalProfile::new("u2", "c@d.com");
    second.unit = Some("Unidad 7".to_string());
    cache.save(&second).unwrap();

    assert_eq!(cache.load().unwrap(), Some(second));
    assert!(cache.clear().unwrap());
    assert!(!cache.clear().unwrap());
    assert_eq!(cache.load().unwrap(), None);
  }

  #[test]
  fn test_display_name_defaults_to_email_local_part() {
    let profile = LocalProfile::from_identity(&identity("u1", "maria.lopez@geo.test"));
    assert_eq!(profile.display_name, "maria.lopez");

    let mut named = identity("u1", "maria.lopez@geo.test");
    named.display_name = Some("María".to_string());
    assert_eq!(LocalProfile::from_identity(&named).display_name, "María");
  }

  #[test]
  fn test_profile_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");
    let profile = LocalProfile::new("u1", "a@b.com");
    {
      let cache = SessionCache::new(Arc::new(Database::open(&path).unwrap()));
      cache.save(&profile).unwrap();
    }
    let cache = SessionCache::new(Arc::new(Database::open(&path).unwrap()));
    assert_eq!(cache.load().unwrap(), Some(profile));
  }

  #[tokio::test]
  async fn test_saved_profile_used_when_provider_unreachable() {
    let cache = cache();
    let saved = LocalProfile::new("u1", "a@b.com");
    cache.save(&saved).unwrap();

    let provider = FakeProvider::new(None);
    provider.set_reachable(false);

    let session = cache.resolve(&provider).await.unwrap();
    assert_eq!(session, Session::Offline(saved.clone()));
    assert_eq!(session.trust(), Trust::Cached);
    assert!(session.is_authenticated());
    assert!(!session.can_write_remote());

    let loaded = cache.load().unwrap().unwrap();
    assert_eq!(loaded, saved);
    assert_eq!(loaded.uid, "u1");
    assert_eq!(loaded.email, "a@b.com");
  }

  #[tokio::test]
  async fn test_live_identity_is_saved_and_trusted() {
    let cache = cache();
    let provider = FakeProvider::new(Some(identity("u9", "x@y.com")));

    let session = cache.resolve(&provider).await.unwrap();
    assert!(session.can_write_remote());
    assert_eq!(session.profile().map(|p| p.uid.as_str()), Some("u9"));
    assert_eq!(cache.load().unwrap().map(|p| p.email), Some("x@y.com".to_string()));
  }

  #[tokio::test]
  async fn test_signed_out_does_not_fall_back() {
    let cache = cache();
    cache.save(&LocalProfile::new("u1", "a@b.com")).unwrap();
    let provider = FakeProvider::new(None);

    let session = cache.resolve(&provider).await.unwrap();
    assert_eq!(session, Session::SignedOut);
    assert!(!session.is_authenticated());
  }

  #[tokio::test]
  async fn test_mirror_follows_provider() {
    let cache = cache();
    // a stale profile from a previous run must survive an empty start
    cache.save(&LocalProfile::new("old", "old@b.com")).unwrap();

    let provider = Arc::new(FakeProvider::new(None));
    let (tx, rx) = watch::channel(false);
    let handle = {
      let cache = cache.clone();
      let provider = provider.clone();
      tokio::spawn(async move { cache.mirror(provider.as_ref(), rx).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.load().unwrap().map(|p| p.uid), Some("old".to_string()));

    provider.set_identity(Some(identity("u1", "a@b.com")));
    wait_until(|| cache.load().unwrap().is_some_and(|p| p.uid == "u1")).await;

    provider.set_identity(None);
    wait_until(|| cache.load().unwrap().is_none()).await;

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
  }
}
