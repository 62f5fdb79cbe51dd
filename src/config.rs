use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Database file (defaults to $XDG_DATA_HOME/showsync/showsync.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub url: String,
  /// Tried in order when the primary url fails a show lookup
  #[serde(default)]
  pub fallback_urls: Vec<String>,
  pub client_id: Option<String>,
  /// Slug or id of the list holding followed shows
  #[serde(default = "default_list")]
  pub list: String,
}

fn default_list() -> String {
  "followed".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_show_details_hours")]
  pub show_details_hours: i64,
  #[serde(default = "default_followed_shows_minutes")]
  pub followed_shows_minutes: i64,
  #[serde(default = "default_episode_watches_minutes")]
  pub episode_watches_minutes: i64,
}

fn default_show_details_hours() -> i64 {
  24
}

fn default_followed_shows_minutes() -> i64 {
  180
}

fn default_episode_watches_minutes() -> i64 {
  60
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      show_details_hours: default_show_details_hours(),
      followed_shows_minutes: default_followed_shows_minutes(),
      episode_watches_minutes: default_episode_watches_minutes(),
    }
  }
}

impl CacheConfig {
  pub fn show_details_stale_time(&self) -> Duration {
    Duration::hours(self.show_details_hours)
  }

  pub fn followed_shows_stale_time(&self) -> Duration {
    Duration::minutes(self.followed_shows_minutes)
  }

  pub fn episode_watches_stale_time(&self) -> Duration {
    Duration::minutes(self.episode_watches_minutes)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./showsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/showsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/showsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("showsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("showsync").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Where the database lives unless configured otherwise.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }
    Ok(data_dir()?.join("showsync.db"))
  }
}

/// $XDG_DATA_HOME/showsync
pub fn data_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .map(|dir| dir.join("showsync"))
    .ok_or_else(|| eyre!("Could not determine the data directory"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("remote:\n  url: https://api.trakt.tv\n").unwrap();
    assert_eq!(config.remote.list, "followed");
    assert!(config.remote.fallback_urls.is_empty());
    assert_eq!(config.cache.show_details_stale_time(), Duration::hours(24));
    assert_eq!(config.cache.followed_shows_stale_time(), Duration::hours(3));
    assert_eq!(config.cache.episode_watches_stale_time(), Duration::hours(1));
    assert!(config.database.is_none());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
remote:
  url: https://api.trakt.tv
  fallback_urls:
    - https://mirror.example.com
  client_id: abc
  list: tv
cache:
  show_details_hours: 6
  followed_shows_minutes: 15
database: /tmp/shows.db
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.remote.fallback_urls, vec!["https://mirror.example.com"]);
    assert_eq!(config.remote.client_id.as_deref(), Some("abc"));
    assert_eq!(config.cache.show_details_stale_time(), Duration::hours(6));
    assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/shows.db"));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/showsync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
