use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  pub session: SessionConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the backend project, e.g. https://abc.supabase.co
  pub url: String,
  /// Websocket endpoint for the change feed (derived from `url` if unset)
  pub realtime_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
  pub user_id: String,
  pub workspace_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Default time-to-live for cached collections
  #[serde(default = "default_ttl_secs")]
  pub default_ttl_secs: u64,
  /// Database location (defaults to the platform data directory)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: default_ttl_secs(),
      path: None,
    }
  }
}

fn default_ttl_secs() -> u64 {
  3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
  /// Fixed delay before reopening a dropped channel
  #[serde(default = "default_reconnect_delay_secs")]
  pub reconnect_delay_secs: u64,
  #[serde(default = "default_heartbeat_secs")]
  pub heartbeat_secs: u64,
}

impl Default for RealtimeConfig {
  fn default() -> Self {
    Self {
      reconnect_delay_secs: default_reconnect_delay_secs(),
      heartbeat_secs: default_heartbeat_secs(),
    }
  }
}

fn default_reconnect_delay_secs() -> u64 {
  5
}

fn default_heartbeat_secs() -> u64 {
  30
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }
}

impl RealtimeConfig {
  pub fn reconnect_delay(&self) -> Duration {
    Duration::from_secs(self.reconnect_delay_secs)
  }

  pub fn heartbeat(&self) -> Duration {
    Duration::from_secs(self.heartbeat_secs)
  }
}

impl RemoteConfig {
  /// Websocket URL of the change feed.
  ///
  /// Falls back to `<url>/realtime/v1/websocket` with the scheme switched to ws(s).
  pub fn realtime_url(&self) -> String {
    if let Some(url) = &self.realtime_url {
      return url.clone();
    }
    let base = self.url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
      format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
      format!("ws://{}", rest)
    } else {
      base.to_string()
    };
    format!("{}/realtime/v1/websocket", base)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./plansync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/plansync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/plansync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("plansync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("plansync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the project API key from the environment.
  pub fn get_api_key() -> Result<String> {
    std::env::var("PLANSYNC_API_KEY")
      .map_err(|_| eyre!("API key not found. Set the PLANSYNC_API_KEY environment variable."))
  }

  /// Get the user's access token from the environment.
  ///
  /// Absent tokens fall back to anonymous access with the API key only.
  pub fn get_access_token() -> Option<String> {
    std::env::var("PLANSYNC_ACCESS_TOKEN").ok()
  }
}
