use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{
  CacheConfig, PersistOptions, DEFAULT_GC_SECS, DEFAULT_MAX_AGE_SECS, DEFAULT_STALE_SECS,
};
use crate::context::{ContextOptions, DEFAULT_GC_INTERVAL};
use crate::storage::SqliteBackend;

/// Environment variable overriding the store location.
pub const STORE_ENV: &str = "REDMINE_TT_STORE";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// SQLite file shared by every context (defaults to the data directory)
  pub store_path: Option<PathBuf>,
  /// Cache buster; persisted caches written under another value are discarded
  pub buster: Option<String>,
  #[serde(default)]
  pub cache: CacheSection,
  #[serde(default)]
  pub storage: StorageSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
  pub stale_time_secs: i64,
  pub gc_time_secs: i64,
  pub max_age_secs: i64,
  pub throttle_ms: u64,
  pub gc_interval_secs: u64,
}

impl Default for CacheSection {
  fn default() -> Self {
    Self {
      stale_time_secs: DEFAULT_STALE_SECS,
      gc_time_secs: DEFAULT_GC_SECS,
      max_age_secs: DEFAULT_MAX_AGE_SECS,
      throttle_ms: 1000,
      gc_interval_secs: DEFAULT_GC_INTERVAL.as_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
  /// How often the store checks for writes from other processes
  pub poll_interval_ms: u64,
}

impl Default for StorageSection {
  fn default() -> Self {
    Self {
      poll_interval_ms: 100,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./redmine-tt.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/redmine-tt/config.yaml
  ///
  /// Without a file every setting takes its default.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("redmine-tt.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("redmine-tt").join("config.yaml");
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
    // An empty file is a valid, all-defaults config
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }

  fn validate(&self) -> Result<()> {
    let cache = &self.cache;
    if cache.stale_time_secs < 0 || cache.gc_time_secs < 0 || cache.max_age_secs < 0 {
      return Err(eyre!("Cache durations must not be negative"));
    }
    if cache.gc_interval_secs == 0 {
      return Err(eyre!("cache.gc_interval_secs must be at least 1"));
    }
    Ok(())
  }

  /// Resolve the store location.
  ///
  /// Checks REDMINE_TT_STORE first, then `store_path`, then the data directory.
  pub fn store_path(&self) -> Result<PathBuf> {
    if let Ok(path) = std::env::var(STORE_ENV) {
      if !path.is_empty() {
        return Ok(PathBuf::from(path));
      }
    }
    match &self.store_path {
      Some(path) => Ok(path.clone()),
      None => SqliteBackend::default_path(),
    }
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.storage.poll_interval_ms.max(1))
  }

  pub fn cache_config(&self) -> CacheConfig {
    CacheConfig {
      stale_time: chrono::Duration::seconds(self.cache.stale_time_secs),
      gc_time: chrono::Duration::seconds(self.cache.gc_time_secs),
    }
  }

  pub fn persist_options(&self) -> PersistOptions {
    let defaults = PersistOptions::default();
    PersistOptions {
      buster: self.buster.clone().unwrap_or(defaults.buster),
      max_age: chrono::Duration::seconds(self.cache.max_age_secs),
      throttle: Duration::from_millis(self.cache.throttle_ms),
      ..defaults
    }
  }

  pub fn context_options(&self) -> ContextOptions {
    ContextOptions {
      cache: self.cache_config(),
      persist: self.persist_options(),
      gc_interval: Duration::from_secs(self.cache.gc_interval_secs),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::parse("").unwrap();
    let options = config.context_options();

    assert_eq!(options.cache.stale_time, chrono::Duration::hours(1));
    assert_eq!(options.cache.gc_time, chrono::Duration::hours(24));
    assert_eq!(options.persist.max_age, chrono::Duration::hours(24));
    assert_eq!(options.persist.throttle, Duration::from_secs(1));
    assert_eq!(options.persist.buster, env!("CARGO_PKG_VERSION"));
    assert_eq!(config.poll_interval(), Duration::from_millis(100));
  }

  #[test]
  fn test_partial_sections_keep_other_defaults() {
    let config = Config::parse(
      "buster: \"2.0.0\"\ncache:\n  stale_time_secs: 60\nstorage:\n  poll_interval_ms: 250\n",
    )
    .unwrap();

    assert_eq!(config.persist_options().buster, "2.0.0");
    assert_eq!(config.cache_config().stale_time, chrono::Duration::minutes(1));
    assert_eq!(config.cache_config().gc_time, chrono::Duration::hours(24));
    assert_eq!(config.poll_interval(), Duration::from_millis(250));
  }

  #[test]
  fn test_negative_durations_are_rejected() {
    let config = Config::parse("cache:\n  gc_time_secs: -1\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "store_path: /tmp/state.db\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.store_path, Some(PathBuf::from("/tmp/state.db")));

    assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());
  }
}
