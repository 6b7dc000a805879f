//! Remote document store boundary.
//!
//! The sync engine only needs three document operations plus an object
//! upload for photo attachments; everything else the app reads from the
//! store is out of scope here.

mod rest;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use rest::RestDocumentStore;

/// Retry policy class for remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
  /// Worth trying again on the next drain
  Retryable,
  /// Will fail the same way every time
  Permanent,
}

/// Errors surfaced by a [`RemoteStore`].
#[derive(Debug, Error)]
pub enum RemoteError {
  /// Connection could not be established
  #[error("remote store unreachable: {0}")]
  Unreachable(String),

  #[error("remote store timed out")]
  Timeout,

  /// Non-success response from the store
  #[error("remote store error ({status}): {message}")]
  Api { status: u16, message: String },

  #[error("document {collection}/{id} not found")]
  NotFound { collection: String, id: String },

  /// The queued payload cannot be turned into a remote call
  #[error("invalid payload: {0}")]
  InvalidPayload(String),
}

impl RemoteError {
  pub fn api(status: u16, message: impl Into<String>) -> Self {
    Self::Api {
      status,
      message: message.into(),
    }
  }

  pub fn invalid_payload(message: impl Into<String>) -> Self {
    Self::InvalidPayload(message.into())
  }

  /// Classify error for retry policy.
  pub fn retry_class(&self) -> RetryClass {
    match self {
      Self::Unreachable(_) | Self::Timeout => RetryClass::Retryable,
      Self::Api { status, .. } => match *status {
        401 | 403 => RetryClass::Retryable,
        408 | 425 | 429 => RetryClass::Retryable,
        500..=599 => RetryClass::Retryable,
        _ => RetryClass::Permanent,
      },
      Self::NotFound { .. } | Self::InvalidPayload(_) => RetryClass::Permanent,
    }
  }

  pub fn is_permanent(&self) -> bool {
    self.retry_class() == RetryClass::Permanent
  }
}

/// Collection/document store the queued mutations are replayed against.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Insert a record into `collection`, returning the new document id when
  /// the store reports one.
  async fn insert(&self, collection: &str, record: &Value)
    -> Result<Option<String>, RemoteError>;

  /// Merge `partial` onto the existing document `collection/id`.
  async fn merge(&self, collection: &str, id: &str, partial: &Value) -> Result<(), RemoteError>;

  async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;

  /// Upload a binary object (photo attachment) to `path`.
  async fn upload_object(
    &self,
    path: &str,
    bytes: &[u8],
    content_type: &str,
  ) -> Result<(), RemoteError>;
}

/// Document id for update/delete payloads: the `id` string field.
pub fn document_id(payload: &Value) -> Result<&str, RemoteError> {
  payload
    .get("id")
    .and_then(Value::as_str)
    .filter(|id| !id.is_empty())
    .ok_or_else(|| RemoteError::invalid_payload("payload has no document \"id\""))
}

#[cfg(test)]
pub mod testing {
  //! In-memory [`RemoteStore`] for engine tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::Mutex;
  use std::time::Duration;

  #[derive(Debug, Clone, PartialEq)]
  pub enum Call {
    Insert(String, Value),
    Merge(String, String, Value),
    Delete(String, String),
    Upload(String, usize),
  }

  /// Records calls; fails any call whose payload `marker` field is listed.
  #[derive(Default)]
  pub struct FakeStore {
    pub calls: Mutex<Vec<Call>>,
    failing: Mutex<HashMap<String, fn() -> RemoteError>>,
    fail_uploads: Mutex<bool>,
    delay: Option<Duration>,
  }

  impl FakeStore {
    pub fn new() -> Self {
      Self::default()
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
      Self {
        delay: Some(delay),
        ..Self::default()
      }
    }

    async fn pause(&self) {
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
    }

    /// Fail every call carrying `"marker": marker` with the error built by `make`.
    pub fn fail_marker(&self, marker: &str, make: fn() -> RemoteError) {
      self
        .failing
        .lock()
        .unwrap()
        .insert(marker.to_string(), make);
    }

    pub fn heal_marker(&self, marker: &str) {
      self.failing.lock().unwrap().remove(marker);
    }

    pub fn fail_uploads(&self, fail: bool) {
      *self.fail_uploads.lock().unwrap() = fail;
    }

    pub fn calls(&self) -> Vec<Call> {
      self.calls.lock().unwrap().clone()
    }

    fn check(&self, value: &Value) -> Result<(), RemoteError> {
      let marker = value.get("marker").and_then(Value::as_str);
      match marker.and_then(|m| self.failing.lock().unwrap().get(m).copied()) {
        Some(make) => Err(make()),
        None => Ok(()),
      }
    }
  }

  #[async_trait]
  impl RemoteStore for FakeStore {
    async fn insert(
      &self,
      collection: &str,
      record: &Value,
    ) -> Result<Option<String>, RemoteError> {
      self.pause().await;
      self.check(record)?;
      let mut calls = self.calls.lock().unwrap();
      calls.push(Call::Insert(collection.to_string(), record.clone()));
      Ok(Some(format!("doc-{}", calls.len())))
    }

    async fn merge(&self, collection: &str, id: &str, partial: &Value) -> Result<(), RemoteError> {
      self.pause().await;
      self.check(partial)?;
      self.calls.lock().unwrap().push(Call::Merge(
        collection.to_string(),
        id.to_string(),
        partial.clone(),
      ));
      Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
      self.pause().await;
      self
        .calls
        .lock()
        .unwrap()
        .push(Call::Delete(collection.to_string(), id.to_string()));
      Ok(())
    }

    async fn upload_object(
      &self,
      path: &str,
      bytes: &[u8],
      _content_type: &str,
    ) -> Result<(), RemoteError> {
      if *self.fail_uploads.lock().unwrap() {
        return Err(RemoteError::Timeout);
      }
      self
        .calls
        .lock()
        .unwrap()
        .push(Call::Upload(path.to_string(), bytes.len()));
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_retry_class() {
    assert_eq!(RemoteError::Timeout.retry_class(), RetryClass::Retryable);
    assert_eq!(
      RemoteError::Unreachable("dns".into()).retry_class(),
      RetryClass::Retryable
    );
    assert_eq!(RemoteError::api(503, "down").retry_class(), RetryClass::Retryable);
    assert_eq!(RemoteError::api(429, "slow").retry_class(), RetryClass::Retryable);
    assert!(RemoteError::api(400, "bad field").is_permanent());
    assert!(RemoteError::invalid_payload("x").is_permanent());
    assert!(RemoteError::NotFound {
      collection: "tareas".into(),
      id: "t1".into()
    }
    .is_permanent());
  }

  #[test]
  fn test_document_id() {
    assert_eq!(document_id(&json!({"id": "abc", "x": 1})).unwrap(), "abc");
    assert!(document_id(&json!({"id": ""})).is_err());
    assert!(document_id(&json!({"id": 5})).is_err());
    assert!(document_id(&json!({})).is_err());
  }
}
