//! Cache gateway that orchestrates the per-class policy with network fetching.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::policy::{PolicyRule, PolicyTable, Strategy};
use super::storage::CacheStorage;
use super::traits::{
  CachedResponse, Fetcher, GatewayRequest, GatewayResponse, RequestKey, ResponseSource,
};
use crate::config::GatewayConfig;

/// Sits between the app and the network, answering every outbound request
/// from the network or the active cache generation according to its class.
pub struct CacheGateway<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: F,
  policy: PolicyTable,
  origin: Url,
  config: GatewayConfig,
}

impl<S: CacheStorage, F: Fetcher> CacheGateway<S, F> {
  pub fn new(storage: S, fetcher: F, config: GatewayConfig) -> Result<Self> {
    let origin = Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid gateway origin {}: {}", config.origin, e))?;
    let policy = PolicyTable::new(origin.clone(), &config);

    Ok(Self {
      storage: Arc::new(storage),
      fetcher,
      policy,
      origin,
      config,
    })
  }

  /// Name of the generation this build installs.
  pub fn cache_name(&self) -> String {
    self.config.cache_name()
  }

  pub fn policy(&self) -> &PolicyTable {
    &self.policy
  }

  /// Generation currently answering lookups.
  pub fn active_cache(&self) -> Result<Option<String>> {
    self.storage.active_cache()
  }

  /// All generations in storage, oldest first.
  pub fn caches(&self) -> Result<Vec<String>> {
    self.storage.cache_names()
  }

  /// Resolve a path or absolute URL against the app origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .origin
      .join(target)
      .map_err(|e| eyre!("Invalid URL {}: {}", target, e))
  }

  /// Fetch every precache asset and store them as this build's generation.
  ///
  /// All or nothing: one failed or non-2xx fetch aborts the install and
  /// leaves storage untouched.
  pub async fn install(&self) -> Result<usize> {
    let cache = self.cache_name();
    let urls = self
      .config
      .precache
      .iter()
      .map(|p| self.resolve(p))
      .collect::<Result<Vec<_>>>()?;

    info!(cache = %cache, assets = urls.len(), "Installing cache generation");

    let entries = try_join_all(urls.into_iter().map(|url| self.precache_one(url))).await?;

    self.storage.populate(&cache, &entries)?;
    info!(cache = %cache, assets = entries.len(), "Cache generation installed");
    Ok(entries.len())
  }

  async fn precache_one(&self, url: Url) -> Result<(RequestKey, CachedResponse)> {
    let request = GatewayRequest::get(url);
    let response = self
      .fetcher
      .fetch(&request)
      .await
      .map_err(|e| eyre!("Failed to precache {}: {}", request.url, e))?;

    if !response.is_success() {
      return Err(eyre!(
        "Failed to precache {}: status {}",
        request.url,
        response.status
      ));
    }
    Ok((request.key(), response))
  }

  /// Make this build's generation active and delete every other one.
  ///
  /// Returns the names of the deleted generations.
  pub fn activate(&self) -> Result<Vec<String>> {
    let cache = self.cache_name();
    if !self.storage.has_cache(&cache)? {
      return Err(eyre!("Cache generation {} is not installed", cache));
    }

    self.storage.set_active_cache(&cache)?;

    let mut purged = Vec::new();
    for name in self.storage.cache_names()? {
      if name != cache && self.storage.delete_cache(&name)? {
        info!(cache = %name, "Deleted stale cache generation");
        purged.push(name);
      }
    }

    info!(cache = %cache, purged = purged.len(), "Cache generation activated");
    Ok(purged)
  }

  /// Install followed by activate.
  pub async fn deploy(&self) -> Result<Vec<String>> {
    self.install().await?;
    self.activate()
  }

  /// Drop cached remote API responses from every generation, keeping the
  /// app shell. Returns the number of entries removed.
  pub fn forget_api_responses(&self) -> Result<usize> {
    let is_api = |raw: &str| Url::parse(raw).is_ok_and(|url| self.policy.is_api_host(&url));

    let mut removed = 0;
    for cache in self.storage.cache_names()? {
      removed += self.storage.remove_where(&cache, &is_api)?;
    }

    if removed > 0 {
      info!(removed, "Cached API responses removed");
    }
    Ok(removed)
  }

  /// Answer one outbound request according to its class.
  pub async fn handle(&self, request: &GatewayRequest) -> Result<GatewayResponse> {
    let rule = self.policy.rule_for(request);
    debug!(url = %request.url, class = ?rule.class, "Gateway request");

    match rule.strategy {
      Strategy::NetworkFirst => self.network_first(request, rule).await,
      Strategy::CacheFirst => self.cache_first(request, rule).await,
      Strategy::NetworkOnly => Ok(self.network_only(request).await),
    }
  }

  async fn network_first(
    &self,
    request: &GatewayRequest,
    rule: PolicyRule,
  ) -> Result<GatewayResponse> {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if rule.write_through {
          self.write_through(request, &response);
        }
        Ok(GatewayResponse::new(response, ResponseSource::Network))
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network failed, trying cache");

        if let Some(hit) = self.lookup(&request.key(), rule.ignore_search)? {
          return Ok(GatewayResponse::new(hit, ResponseSource::Cache));
        }

        if rule.offline_page {
          let page = RequestKey::new("GET", &self.resolve(&self.config.offline_page)?);
          if let Some(hit) = self.lookup(&page, false)? {
            return Ok(GatewayResponse::new(hit, ResponseSource::OfflinePage));
          }
        }

        Ok(unavailable())
      }
    }
  }

  async fn cache_first(&self, request: &GatewayRequest, rule: PolicyRule) -> Result<GatewayResponse> {
    if let Some(hit) = self.lookup(&request.key(), rule.ignore_search)? {
      return Ok(GatewayResponse::new(hit, ResponseSource::Cache));
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if rule.write_through {
          self.write_through(request, &response);
        }
        Ok(GatewayResponse::new(response, ResponseSource::Network))
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Asset not cached and network failed");
        Ok(unavailable())
      }
    }
  }

  async fn network_only(&self, request: &GatewayRequest) -> GatewayResponse {
    match self.fetcher.fetch(request).await {
      Ok(response) => GatewayResponse::new(response, ResponseSource::Network),
      Err(e) => {
        debug!(url = %request.url, method = %request.method, error = %e, "Bypass request failed");
        unavailable()
      }
    }
  }

  fn lookup(&self, key: &RequestKey, ignore_search: bool) -> Result<Option<CachedResponse>> {
    let Some(cache) = self.storage.active_cache()? else {
      return Ok(None);
    };
    Ok(
      self
        .storage
        .lookup(&cache, key, ignore_search)?
        .map(|entry| entry.response),
    )
  }

  /// Store a successful response in the active generation. Failures are
  /// logged and never affect the answer already obtained.
  fn write_through(&self, request: &GatewayRequest, response: &CachedResponse) {
    if !response.is_success() {
      return;
    }

    let result = self.storage.active_cache().and_then(|active| match active {
      Some(cache) => self.storage.put(&cache, &request.key(), response),
      None => Ok(()),
    });

    if let Err(e) = result {
      warn!(url = %request.url, error = %e, "Failed to cache response");
    }
  }
}

fn unavailable() -> GatewayResponse {
  GatewayResponse::new(CachedResponse::offline(), ResponseSource::Unavailable)
}
