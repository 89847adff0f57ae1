use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::push::Notification;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the agent is installed for; same-origin URLs map to manifest keys
  pub origin: Url,
  /// Path to the published manifest JSON (resource key → content hash)
  pub manifest: PathBuf,
  /// Application shell fetched into staging at install time
  #[serde(default = "default_shell")]
  pub shell: Vec<String>,
  /// Prefix of every tier name
  #[serde(default = "default_cache_prefix")]
  pub cache_prefix: String,
  /// SQLite database path (defaults to the platform data directory)
  pub database: Option<PathBuf>,
  /// Sync tag that drains the queue
  #[serde(default = "default_sync_tag")]
  pub sync_tag: String,
  /// Activate right after install instead of waiting for SKIP_WAITING
  #[serde(default = "default_skip_waiting")]
  pub skip_waiting: bool,
  pub request_timeout_secs: Option<u64>,
  /// Write logs to a daily file here instead of stderr
  pub log_dir: Option<PathBuf>,
  /// Defaults for push notifications
  #[serde(default)]
  pub notification: Notification,
}

fn default_shell() -> Vec<String> {
  vec!["index.html".to_string()]
}

fn default_cache_prefix() -> String {
  "offcache".to_string()
}

fn default_sync_tag() -> String {
  "background-sync".to_string()
}

fn default_skip_waiting() -> bool {
  true
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
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
        "No configuration file found. Create one at ~/.config/offcache/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let mut config = Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    // manifest path is relative to the config file
    if config.manifest.is_relative() {
      if let Some(dir) = path.parent() {
        config.manifest = dir.join(&config.manifest);
      }
    }

    Ok(config)
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    if !matches!(config.origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", config.origin));
    }
    if config.cache_prefix.is_empty() {
      return Err(eyre!("cache_prefix must not be empty"));
    }

    Ok(config)
  }
}
