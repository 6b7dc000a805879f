//! Request/response types and the network seam of the gateway.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

/// How the page issued the request, mirroring `Request.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level document load
  Navigate,
  Cors,
  NoCors,
  SameOrigin,
}

/// An intercepted outbound request.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
  pub method: String,
  pub url: Url,
  pub mode: RequestMode,
  pub accept: Option<String>,
}

impl GatewayRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      mode: RequestMode::Cors,
      accept: None,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      accept: Some("text/html".to_string()),
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_uppercase();
    self
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }

  /// Cache identity of this request.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Normalized identity of a request in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
  pub method: String,
  /// Full URL without fragment
  pub url: String,
  /// URL without query string or fragment
  pub url_without_search: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut exact = url.clone();
    exact.set_fragment(None);

    let mut bare = exact.clone();
    bare.set_query(None);

    Self {
      method: method.to_uppercase(),
      url: exact.to_string(),
      url_without_search: bare.to_string(),
    }
  }

  /// SHA256 hash for stable, fixed-length keys
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response body plus the headers worth replaying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl CachedResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_lowercase(), value.to_string()));
    self
  }

  /// Synthetic reply when neither cache nor network can answer.
  pub fn offline() -> Self {
    Self::new(503, "Offline").with_header("content-type", "text/plain")
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Where a gateway answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
  Network,
  Cache,
  /// The static offline page stood in for a navigation
  OfflinePage,
  /// Synthetic 503
  Unavailable,
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
  pub response: CachedResponse,
  pub source: ResponseSource,
}

impl GatewayResponse {
  pub fn new(response: CachedResponse, source: ResponseSource) -> Self {
    Self { response, source }
  }
}

/// The request never produced a response.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("network error: {0}")]
  Network(String),
  #[error("request timed out")]
  Timeout,
}

/// The network side of the gateway.
#[async_trait]
pub trait Fetcher: Send + Sync {
  /// Perform the request. HTTP error statuses are responses, not errors.
  async fn fetch(&self, request: &GatewayRequest) -> Result<CachedResponse, FetchError>;
}
