//! HTTP implementation of the gateway's network seam.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::ACCEPT;
use reqwest::Method;
use std::time::Duration;

use super::traits::{CachedResponse, FetchError, Fetcher, GatewayRequest};

/// Response headers kept alongside a cached body.
const KEPT_HEADERS: [&str; 4] = ["content-type", "cache-control", "etag", "last-modified"];

pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &GatewayRequest) -> Result<CachedResponse, FetchError> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| FetchError::Network(format!("invalid method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    if let Some(accept) = &request.accept {
      builder = builder.header(ACCEPT, accept);
    }

    let response = builder.send().await.map_err(fetch_error)?;
    let status = response.status().as_u16();
    let headers = KEPT_HEADERS
      .iter()
      .filter_map(|name| {
        response
          .headers()
          .get(*name)
          .and_then(|v| v.to_str().ok())
          .map(|v| (name.to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(fetch_error)?;

    Ok(CachedResponse {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

fn fetch_error(e: reqwest::Error) -> FetchError {
  if e.is_timeout() {
    FetchError::Timeout
  } else {
    FetchError::Network(e.to_string())
  }
}
