use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Directory for offline.db, sw-cache.db and logs (defaults to $XDG_DATA_HOME/geopoint)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub gateway: GatewayConfig,
  #[serde(default)]
  pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the document store REST endpoint
  pub base_url: String,
  /// Project id, appended as the first path segment when set
  pub project: Option<String>,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      base_url: "https://firestore.googleapis.com/v1".to_string(),
      project: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Failed attempts after which a queued item is abandoned
  pub max_attempts: u32,
  /// Timer tick for periodic drains
  pub poll_interval_secs: u64,
  /// Abandon permanently rejected items on the first failure
  pub fail_fast_permanent: bool,
  /// Add a `syncedAt` field to created and updated records
  pub stamp_synced_at: bool,
  /// Delete synced rows after a drain that leaves nothing pending
  pub compact_after_drain: bool,
  pub write_policy: WritePolicy,
}

/// When a write goes through the offline queue.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
  /// Apply directly while online with an empty queue, queue otherwise
  #[default]
  QueueWhenOffline,
  /// Every write is queued and applied by the next drain
  AlwaysQueue,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      poll_interval_secs: 30,
      fail_fast_permanent: true,
      stamp_synced_at: true,
      compact_after_drain: true,
      write_policy: WritePolicy::default(),
    }
  }
}

impl SyncConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// URL probed with HEAD requests; without it the agent assumes it is online
  pub probe_url: Option<String>,
  pub probe_interval_secs: u64,
  pub probe_timeout_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: 5,
      probe_timeout_secs: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
  pub cache_prefix: String,
  /// Bumped on every deployment; the cache generation is `{cache_prefix}-{version}`
  pub version: String,
  /// Origin the app shell is served from
  pub origin: String,
  /// App shell assets that must be cached for install to succeed
  pub precache: Vec<String>,
  pub offline_page: String,
  /// Host substrings identifying the document store / auth APIs
  pub api_hosts: Vec<String>,
  pub static_extensions: Vec<String>,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      cache_prefix: "geopoint".to_string(),
      version: "v4".to_string(),
      origin: "http://localhost:8080".to_string(),
      precache: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/menu.html".to_string(),
        "/formulario.html".to_string(),
        "/offline.html".to_string(),
        "/styles.css".to_string(),
        "/manifest.json".to_string(),
      ],
      offline_page: "/offline.html".to_string(),
      api_hosts: vec!["firebaseio".to_string(), "googleapis".to_string()],
      static_extensions: ["js", "css", "json", "png", "jpg", "svg", "ico", "woff2"]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    }
  }
}

impl GatewayConfig {
  /// Name of the cache generation for this deployment.
  pub fn cache_name(&self) -> String {
    format!("{}-{}", self.cache_prefix, self.version)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
  /// Account lookup endpoint (including any API key query parameter)
  pub lookup_url: Option<String>,
  pub refresh_interval_secs: u64,
}

impl Default for AuthConfig {
  fn default() -> Self {
    Self {
      lookup_url: None,
      refresh_interval_secs: 300,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./geopoint.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/geopoint/config.yaml
  ///
  /// With no file found, defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("geopoint.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("geopoint").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Resolve the data directory, creating it if needed.
  pub fn data_dir(&self) -> Result<PathBuf> {
    let dir = match &self.data_dir {
      Some(dir) => dir.clone(),
      None => dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
        .ok_or_else(|| eyre!("Could not determine data directory"))?
        .join("geopoint"),
    };

    std::fs::create_dir_all(&dir)
      .map_err(|e| eyre!("Failed to create data directory {}: {}", dir.display(), e))?;

    Ok(dir)
  }

  /// Get the document store bearer token from environment variables.
  ///
  /// Checks GEOPOINT_API_TOKEN first, then FIREBASE_ID_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("GEOPOINT_API_TOKEN")
      .or_else(|_| std::env::var("FIREBASE_ID_TOKEN"))
      .map_err(|_| {
        eyre!(
          "Document store token not found. Set GEOPOINT_API_TOKEN or FIREBASE_ID_TOKEN environment variable."
        )
      })
  }
}
