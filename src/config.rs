use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::listener::DEFAULT_DEBOUNCE;
use crate::retry::DEFAULT_RETRY_BOUND;
use crate::server::EnvToken;

/// Environment variable holding the user's id token.
pub const ID_TOKEN_ENV: &str = "APPHIVE_ID_TOKEN";

const APP_DIR: &str = "apphive-query";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub realtime: RealtimeConfig,
  #[serde(default)]
  pub query: QueryConfig,
  /// Signed-in user; part of every cache key
  pub user_uid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// e.g. "https://api.apphive.io"; requests go to `{host}/v2{path}`
  pub host: String,
  /// Headers sent with every request
  #[serde(default)]
  pub extra_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RealtimeConfig {
  /// Firebase Realtime Database URL the update timestamps are written to
  pub database_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
  /// Namespace prefix of every cache key
  #[serde(default)]
  pub base_key: Vec<String>,
  #[serde(default = "default_retry_bound")]
  pub retry_bound: u32,
  /// Staleness window; unset means data never goes stale
  pub stale_time_ms: Option<u64>,
  pub debounce_ms: Option<u64>,
  /// Most entries kept in the query cache; unbounded when unset
  pub cache_capacity: Option<u64>,
}

fn default_retry_bound() -> u32 {
  DEFAULT_RETRY_BOUND
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      base_key: Vec::new(),
      retry_bound: DEFAULT_RETRY_BOUND,
      stale_time_ms: None,
      debounce_ms: None,
      cache_capacity: None,
    }
  }
}

impl QueryConfig {
  pub fn stale_time(&self) -> Option<Duration> {
    self.stale_time_ms.map(Duration::from_millis)
  }

  pub fn debounce(&self) -> Duration {
    self
      .debounce_ms
      .map(Duration::from_millis)
      .unwrap_or(DEFAULT_DEBOUNCE)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./apphive-query.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/apphive-query/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(Error::Config(format!(
        "No configuration file found. Create one at ~/.config/{}/config.yaml",
        APP_DIR
      ))),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from(format!("{}.yaml", APP_DIR));
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      Error::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_yaml(&contents).map_err(|e| match e {
      Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
      other => other,
    })
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents)
      .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
  }

  /// Token source reading [`ID_TOKEN_ENV`]; requests are unauthenticated
  /// while it is unset.
  pub fn token_provider() -> EnvToken {
    EnvToken::new(ID_TOKEN_ENV)
  }

  /// Directory for log files.
  pub fn log_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;

    Ok(data_dir.join(APP_DIR).join("logs"))
  }
}
