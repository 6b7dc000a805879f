//! Request-interception cache gateway.
//!
//! Every outbound request is classified (navigation, remote API, static
//! asset, bypass) and answered network-first or cache-first from a named,
//! versioned cache generation. A new generation is installed all-or-nothing
//! and activating it deletes every other generation.

pub mod fetch;
pub mod layer;
pub mod policy;
pub mod storage;
pub mod traits;

pub use fetch::HttpFetcher;
pub use layer::CacheGateway;
pub use policy::{PolicyRule, PolicyTable, RequestClass, Strategy};
pub use storage::{CacheStorage, SqliteCacheStorage};
pub use traits::{
  CachedResponse, FetchError, Fetcher, GatewayRequest, GatewayResponse, RequestKey, RequestMode,
  ResponseSource,
};
