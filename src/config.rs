use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::SqliteStorage;
use crate::error::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_PAGE_SIZE: u32 = 10;
/// GitHub caps `per_page` at 100
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub github: GitHubConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubConfig {
  #[serde(default = "default_api_url")]
  pub api_url: String,
  /// User whose repositories are browsed
  pub owner: Option<String>,
}

impl Default for GitHubConfig {
  fn default() -> Self {
    Self {
      api_url: default_api_url(),
      owner: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Database file (defaults to $XDG_DATA_HOME/repocat/cache.db)
  pub path: Option<PathBuf>,
  #[serde(default = "default_page_size")]
  pub page_size: u32,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      page_size: default_page_size(),
    }
  }
}

fn default_api_url() -> String {
  DEFAULT_API_URL.to_string()
}

fn default_page_size() -> u32 {
  DEFAULT_PAGE_SIZE
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./repocat.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/repocat/config.yaml
  ///
  /// Defaults are used when no file exists.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("repocat.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("repocat").join("config.yaml");
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

    Self::parse(&contents).map_err(|e| match e {
      Error::Config(msg) => Error::Config(format!("{} ({})", msg, path.display())),
      other => other,
    })
  }

  /// Parse and validate YAML configuration.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)
      .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  /// Check values that serde cannot.
  pub fn validate(&self) -> Result<()> {
    if !(1..=MAX_PAGE_SIZE).contains(&self.cache.page_size) {
      return Err(Error::Config(format!(
        "cache.page_size must be between 1 and {}, got {}",
        MAX_PAGE_SIZE, self.cache.page_size
      )));
    }
    Ok(())
  }

  /// Resolved database location.
  pub fn cache_path(&self) -> Result<PathBuf> {
    match &self.cache.path {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  /// Get the GitHub token from environment variables.
  ///
  /// Checks REPOCAT_GITHUB_TOKEN first, then GITHUB_TOKEN as fallback.
  pub fn github_token() -> Option<String> {
    std::env::var("REPOCAT_GITHUB_TOKEN")
      .or_else(|_| std::env::var("GITHUB_TOKEN"))
      .ok()
      .filter(|token| !token.is_empty())
  }
}
