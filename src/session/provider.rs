//! Identity provider backed by an account lookup endpoint.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use super::{Identity, IdentityProvider};
use crate::config::{AuthConfig, Config};
use crate::remote::RemoteError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
  #[serde(default)]
  users: Vec<LookupUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
  local_id: String,
  #[serde(default)]
  email: String,
  display_name: Option<String>,
  /// JSON-encoded custom claims (`client`, `unit`)
  custom_attributes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CustomClaims {
  client: Option<String>,
  #[serde(alias = "unidad")]
  unit: Option<String>,
}

impl From<LookupUser> for Identity {
  fn from(user: LookupUser) -> Self {
    let claims: CustomClaims = user
      .custom_attributes
      .as_deref()
      .and_then(|raw| serde_json::from_str(raw).ok())
      .unwrap_or_default();

    Identity {
      uid: user.local_id,
      email: user.email,
      display_name: user.display_name,
      client: claims.client,
      unit: claims.unit,
    }
  }
}

/// Resolves the bearer token to an account and publishes changes.
pub struct AccountLookupProvider {
  client: reqwest::Client,
  url: Url,
  token: String,
  interval: Duration,
  tx: watch::Sender<Option<Identity>>,
}

impl AccountLookupProvider {
  pub fn new(config: &AuthConfig, token: String) -> Result<Option<Self>> {
    let Some(raw) = &config.lookup_url else {
      return Ok(None);
    };

    let url = Url::parse(raw).map_err(|e| eyre!("Invalid auth lookup_url {}: {}", raw, e))?;
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    let (tx, _) = watch::channel(None);

    Ok(Some(Self {
      client,
      url,
      token,
      interval: Duration::from_secs(config.refresh_interval_secs.max(1)),
      tx,
    }))
  }

  /// Build from configuration and the token in the environment.
  pub fn from_config(config: &Config) -> Result<Option<Self>> {
    if config.auth.lookup_url.is_none() {
      return Ok(None);
    }
    Self::new(&config.auth, Config::get_api_token()?)
  }

  async fn lookup(&self) -> Result<Option<Identity>, RemoteError> {
    let response = self
      .client
      .post(self.url.clone())
      .json(&json!({ "idToken": self.token }))
      .send()
      .await
      .map_err(|e| {
        if e.is_timeout() {
          RemoteError::Timeout
        } else {
          RemoteError::Unreachable(e.to_string())
        }
      })?;

    let status = response.status();
    // a rejected token means nobody is signed in
    if status.as_u16() == 400 || status.as_u16() == 401 {
      debug!(%status, "Token rejected by identity provider");
      return Ok(None);
    }
    if !status.is_success() {
      let message = response.text().await.unwrap_or_default();
      return Err(RemoteError::api(status.as_u16(), message));
    }

    let body: LookupResponse = response
      .json()
      .await
      .map_err(|e| RemoteError::api(status.as_u16(), format!("unreadable lookup response: {}", e)))?;

    Ok(body.users.into_iter().next().map(Identity::from))
  }

  /// Refresh the published identity until `shutdown` flips to true.
  ///
  /// Unreachable lookups keep the last published value.
  pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if let Err(e) = self.current_identity().await {
            warn!(error = %e, "Identity refresh failed");
          }
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            break;
          }
        }
      }
    }
    info!("Identity refresh stopped");
  }
}

#[async_trait]
impl IdentityProvider for AccountLookupProvider {
  async fn current_identity(&self) -> Result<Option<Identity>, RemoteError> {
    let identity = self.lookup().await?;
    self.tx.send_if_modified(|current| {
      if *current == identity {
        return false;
      }
      *current = identity.clone();
      true
    });
    Ok(identity)
  }

  fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
    self.tx.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_lookup_user_to_identity() {
    let body = r#"{
      "users": [{
        "localId": "u1",
        "email": "a@b.com",
        "customAttributes": "{\"client\":\"Acme\",\"unidad\":\"U-7\"}"
      }]
    }"#;
    let parsed: LookupResponse = serde_json::from_str(body).unwrap();
    let identity = Identity::from(parsed.users.into_iter().next().unwrap());

    assert_eq!(identity.uid, "u1");
    assert_eq!(identity.email, "a@b.com");
    assert_eq!(identity.display_name, None);
    assert_eq!(identity.client.as_deref(), Some("Acme"));
    assert_eq!(identity.unit.as_deref(), Some("U-7"));
  }

  #[test]
  fn test_provider_requires_lookup_url() {
    let config = AuthConfig::default();
    assert!(AccountLookupProvider::new(&config, "t".to_string())
      .unwrap()
      .is_none());

    let config = AuthConfig {
      lookup_url: Some("::".to_string()),
      ..AuthConfig::default()
    };
    assert!(AccountLookupProvider::new(&config, "t".to_string()).is_err());
  }
}
