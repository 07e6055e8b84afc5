use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::Preferences;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  /// Custom title for header (defaults to the dataset key if not set)
  pub title: Option<String>,
  #[serde(default)]
  pub refresh: RefreshConfig,
  #[serde(default)]
  pub preferences: PreferencesConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base url of the KPI API; datasets are requested below it
  pub url: String,
  #[serde(default = "default_dataset")]
  pub dataset: String,
}

fn default_dataset() -> String {
  "kpis".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
  pub interval_secs: u64,
  pub max_retries: u32,
  pub retry_delay_ms: u64,
  /// Give up on a single fetch after this long (unset = wait forever)
  pub fetch_timeout_secs: Option<u64>,
}

impl Default for RefreshConfig {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      max_retries: 3,
      retry_delay_ms: 5000,
      fetch_timeout_secs: None,
    }
  }
}

impl RefreshConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }

  pub fn retry_delay(&self) -> Duration {
    Duration::from_millis(self.retry_delay_ms)
  }

  pub fn fetch_timeout(&self) -> Option<Duration> {
    self.fetch_timeout_secs.map(Duration::from_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreferencesConfig {
  pub period: String,
  pub auto_refresh: bool,
}

impl Default for PreferencesConfig {
  fn default() -> Self {
    let defaults = Preferences::default();
    Self {
      period: defaults.period,
      auto_refresh: defaults.auto_refresh,
    }
  }
}

impl From<PreferencesConfig> for Preferences {
  fn from(config: PreferencesConfig) -> Self {
    Self {
      period: config.period,
      auto_refresh: config.auto_refresh,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  pub max_age_secs: u64,
  /// Prefix for every key this dashboard writes to the cache store
  pub namespace: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      max_age_secs: 300,
      namespace: "cache_".to_string(),
    }
  }
}

impl CacheConfig {
  pub fn max_age(&self) -> Duration {
    Duration::from_secs(self.max_age_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pulseboard.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pulseboard/config.yaml
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
        "No configuration file found. Create one at ~/.config/pulseboard/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("pulseboard.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pulseboard").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Header title: the configured one, or the dataset key.
  pub fn display_title(&self) -> &str {
    self.title.as_deref().unwrap_or(&self.api.dataset)
  }

  /// Get the API bearer token from environment variables.
  ///
  /// Checks PULSEBOARD_API_TOKEN first, then API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("PULSEBOARD_API_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set PULSEBOARD_API_TOKEN or API_TOKEN environment variable.")
      })
  }
}
