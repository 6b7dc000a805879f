//! Request classification and the per-class caching policy.
//!
//! Classification runs once per request and is independent of the actual
//! fetch, so it can be tested on its own.

use url::Url;

use super::traits::{GatewayRequest, RequestMode};
use crate::config::GatewayConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
  /// HTML document load
  Navigation,
  /// Document store / auth host
  RemoteApi,
  /// Scripts, styles, manifest and anything else fetched with GET
  StaticAsset,
  /// Non-GET; never cached
  Bypass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  NetworkFirst,
  CacheFirst,
  NetworkOnly,
}

/// What to do for one request class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyRule {
  pub class: RequestClass,
  pub strategy: Strategy,
  /// Match cached entries on the URL without its query string
  pub ignore_search: bool,
  /// Store successful network responses in the active generation
  pub write_through: bool,
  /// Last resort for a navigation with no cached copy
  pub offline_page: bool,
}

/// Ordered policy table: classifier plus one rule per class.
#[derive(Debug, Clone)]
pub struct PolicyTable {
  origin: Url,
  api_hosts: Vec<String>,
  static_extensions: Vec<String>,
  rules: Vec<PolicyRule>,
}

const DEFAULT_RULES: [PolicyRule; 4] = [
  PolicyRule {
    class: RequestClass::Navigation,
    strategy: Strategy::NetworkFirst,
    ignore_search: true,
    write_through: true,
    offline_page: true,
  },
  PolicyRule {
    class: RequestClass::RemoteApi,
    strategy: Strategy::NetworkFirst,
    ignore_search: false,
    write_through: true,
    offline_page: false,
  },
  PolicyRule {
    class: RequestClass::StaticAsset,
    strategy: Strategy::CacheFirst,
    ignore_search: false,
    write_through: true,
    offline_page: false,
  },
  PolicyRule {
    class: RequestClass::Bypass,
    strategy: Strategy::NetworkOnly,
    ignore_search: false,
    write_through: false,
    offline_page: false,
  },
];

impl PolicyTable {
  pub fn new(origin: Url, config: &GatewayConfig) -> Self {
    Self {
      origin,
      api_hosts: config.api_hosts.iter().map(|h| h.to_lowercase()).collect(),
      static_extensions: config
        .static_extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect(),
      rules: DEFAULT_RULES.to_vec(),
    }
  }

  /// Decide the class of a request. First match wins.
  pub fn classify(&self, request: &GatewayRequest) -> RequestClass {
    if !request.is_get() {
      return RequestClass::Bypass;
    }
    if self.is_navigation(request) {
      return RequestClass::Navigation;
    }
    if self.is_api_host(&request.url) {
      return RequestClass::RemoteApi;
    }
    RequestClass::StaticAsset
  }

  pub fn rule(&self, class: RequestClass) -> PolicyRule {
    self
      .rules
      .iter()
      .copied()
      .find(|r| r.class == class)
      .unwrap_or(DEFAULT_RULES[3])
  }

  /// Classify and look up the rule in one go.
  pub fn rule_for(&self, request: &GatewayRequest) -> PolicyRule {
    self.rule(self.classify(request))
  }

  fn is_navigation(&self, request: &GatewayRequest) -> bool {
    if request.mode == RequestMode::Navigate {
      return true;
    }

    let wants_html = request
      .accept
      .as_deref()
      .is_some_and(|a| a.contains("text/html"));
    if !wants_html || request.url.origin() != self.origin.origin() {
      return false;
    }

    // an HTML accept header on a static file is still an asset fetch
    !self.has_static_extension(&request.url)
  }

  /// Whether `url` points at the document store or auth APIs.
  pub fn is_api_host(&self, url: &Url) -> bool {
    let Some(host) = url.host_str() else {
      return false;
    };
    let host = host.to_lowercase();
    self.api_hosts.iter().any(|h| host.contains(h.as_str()))
  }

  fn has_static_extension(&self, url: &Url) -> bool {
    let path = url.path();
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
      Some((_, ext)) => self.static_extensions.iter().any(|e| e == &ext.to_lowercase()),
      None => false,
    }
  }
}
