//! REST client for the cloud document store.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{RemoteError, RemoteStore};
use crate::config::{Config, RemoteConfig};

/// Response body of a document insert.
#[derive(Debug, Deserialize)]
struct InsertResponse {
  id: Option<String>,
  /// Full resource name (`.../documents/{collection}/{id}`)
  name: Option<String>,
}

/// Document store client speaking plain JSON over HTTPS.
#[derive(Clone)]
pub struct RestDocumentStore {
  client: reqwest::Client,
  base: Url,
  token: String,
}

impl RestDocumentStore {
  pub fn new(config: &RemoteConfig, token: String) -> Result<Self> {
    let mut raw = config.base_url.trim_end_matches('/').to_string();
    if let Some(project) = &config.project {
      raw = format!("{}/projects/{}", raw, project);
    }
    // segments are appended after the trailing slash is popped
    let base = Url::parse(&format!("{}/", raw))
      .map_err(|e| eyre!("Invalid remote base_url {}: {}", config.base_url, e))?;

    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  /// Build a client from configuration and the token in the environment.
  pub fn from_config(config: &Config) -> Result<Self> {
    Self::new(&config.remote, Config::get_api_token()?)
  }

  /// Append `segments` to the base URL, each percent-encoded as one segment.
  fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
    if let Some(bad) = segments
      .iter()
      .find(|s| s.is_empty() || **s == "." || **s == "..")
    {
      return Err(RemoteError::invalid_payload(format!(
        "bad document path segment {:?}",
        bad
      )));
    }

    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| RemoteError::invalid_payload("remote base_url cannot hold a path"))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    self.client.request(method, url).bearer_auth(&self.token)
  }

  async fn send(
    &self,
    builder: RequestBuilder,
    not_found: Option<(&str, &str)>,
  ) -> Result<Response, RemoteError> {
    let response = builder.send().await.map_err(transport_error)?;
    let status = response.status();

    if status.is_success() {
      return Ok(response);
    }

    if status == StatusCode::NOT_FOUND {
      if let Some((collection, id)) = not_found {
        return Err(RemoteError::NotFound {
          collection: collection.to_string(),
          id: id.to_string(),
        });
      }
    }

    let message = response.text().await.unwrap_or_default();
    Err(RemoteError::api(status.as_u16(), message))
  }
}

/// Document id from an insert response: `id`, or the last segment of `name`.
fn inserted_id(body: &[u8]) -> Option<String> {
  let body: InsertResponse = serde_json::from_slice(body).ok()?;
  body
    .id
    .or_else(|| body.name.and_then(|n| n.rsplit('/').next().map(String::from)))
    .filter(|id| !id.is_empty())
}

fn transport_error(e: reqwest::Error) -> RemoteError {
  if e.is_timeout() {
    RemoteError::Timeout
  } else {
    RemoteError::Unreachable(e.to_string())
  }
}

#[async_trait]
impl RemoteStore for RestDocumentStore {
  async fn insert(&self, collection: &str, record: &Value) -> Result<Option<String>, RemoteError> {
    let url = self.url(&["documents", collection])?;
    let response = self
      .send(self.request(Method::POST, url).json(record), None)
      .await?;

    // the document exists from here on, so a bad body must not fail the write
    let id = match response.bytes().await {
      Ok(body) => inserted_id(&body),
      Err(e) => {
        warn!(collection, error = %e, "Insert response body lost");
        None
      }
    };

    match &id {
      Some(id) => debug!(collection, id = %id, "Document inserted"),
      None => warn!(collection, "Document inserted, store reported no id"),
    }
    Ok(id)
  }

  async fn merge(&self, collection: &str, id: &str, partial: &Value) -> Result<(), RemoteError> {
    let url = self.url(&["documents", collection, id])?;
    self
      .send(
        self.request(Method::PATCH, url).json(partial),
        Some((collection, id)),
      )
      .await?;
    debug!(collection, id, "Document merged");
    Ok(())
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
    let url = self.url(&["documents", collection, id])?;
    self
      .send(self.request(Method::DELETE, url), Some((collection, id)))
      .await?;
    debug!(collection, id, "Document deleted");
    Ok(())
  }

  async fn upload_object(
    &self,
    path: &str,
    bytes: &[u8],
    content_type: &str,
  ) -> Result<(), RemoteError> {
    let mut url = self.url(&["objects"])?;
    url.query_pairs_mut().append_pair("name", path);

    self
      .send(
        self
          .request(Method::POST, url)
          .header(reqwest::header::CONTENT_TYPE, content_type)
          .body(bytes.to_vec()),
        None,
      )
      .await?;
    debug!(path, bytes = bytes.len(), "Object uploaded");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_base_url_includes_project() {
    let config = RemoteConfig {
      base_url: "https://store.example.com/v1/".to_string(),
      project: Some("geopoint".to_string()),
    };
    let store = RestDocumentStore::new(&config, "t".to_string()).unwrap();
    let url = store.url(&["documents", "tareas", "abc"]).unwrap();
    assert_eq!(
      url.as_str(),
      "https://store.example.com/v1/projects/geopoint/documents/tareas/abc"
    );
  }

  #[test]
  fn test_document_ids_stay_inside_their_segment() {
    let config = RemoteConfig {
      base_url: "https://store.example.com/v1".to_string(),
      project: None,
    };
    let store = RestDocumentStore::new(&config, "t".to_string()).unwrap();

    let url = store.url(&["documents", "tareas", "a/b?c#d"]).unwrap();
    assert_eq!(
      url.as_str(),
      "https://store.example.com/v1/documents/tareas/a%2Fb%3Fc%23d"
    );
    assert_eq!(url.query(), None);

    for id in ["..", ".", ""] {
      let err = store.url(&["documents", "tareas", id]).unwrap_err();
      assert!(err.is_permanent());
    }
  }

  #[test]
  fn test_inserted_id() {
    assert_eq!(inserted_id(br#"{"id":"abc"}"#).as_deref(), Some("abc"));
    assert_eq!(
      inserted_id(br#"{"name":"projects/p/documents/tareas/xyz"}"#).as_deref(),
      Some("xyz")
    );
    assert_eq!(inserted_id(b"<html>ok</html>"), None);
    assert_eq!(inserted_id(b""), None);
    assert_eq!(inserted_id(br#"{}"#), None);
  }

  #[test]
  fn test_invalid_base_url() {
    let config = RemoteConfig {
      base_url: "not a url".to_string(),
      project: None,
    };
    assert!(RestDocumentStore::new(&config, "t".to_string()).is_err());
  }
}
