//! User settings shared by every context under the `"settings"` key.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::binding::{LiveValue, StorageBinding, Subscription};
use crate::storage::KvStore;

/// Storage key of the settings.
pub const SETTINGS_KEY: &str = "settings";

/// Language value meaning "follow the browser".
pub const BROWSER_LANGUAGE: &str = "browser";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
  #[serde(rename = "redmineURL", default)]
  pub redmine_url: String,
  #[serde(rename = "redmineApiKey", default)]
  pub redmine_api_key: String,
  #[serde(default = "default_language")]
  pub language: String,
  #[serde(default)]
  pub options: SettingsOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsOptions {
  /// Pause the running timer when another one is started
  pub auto_pause_on_switch: bool,
  /// Search issues across all projects, not only assigned ones
  pub extended_search: bool,
  pub round_time_nearest_quarter_hour: bool,
}

fn default_language() -> String {
  BROWSER_LANGUAGE.to_string()
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      redmine_url: String::new(),
      redmine_api_key: String::new(),
      language: default_language(),
      options: SettingsOptions::default(),
    }
  }
}

/// A settings field that failed validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SettingsError {
  #[error("Redmine URL is required")]
  MissingUrl,
  #[error("Redmine URL is not a valid http(s) URL: {0}")]
  InvalidUrl(String),
  #[error("Redmine API key is required")]
  MissingApiKey,
  #[error("invalid language: {0}")]
  InvalidLanguage(String),
}

impl Settings {
  /// Check the fields a save requires. Returns every problem found.
  pub fn validate(&self) -> Result<(), Vec<SettingsError>> {
    let mut errors = Vec::new();

    let url = self.redmine_url.trim();
    if url.is_empty() {
      errors.push(SettingsError::MissingUrl);
    } else {
      match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() => {}
        _ => errors.push(SettingsError::InvalidUrl(url.to_string())),
      }
    }

    if self.redmine_api_key.trim().is_empty() {
      errors.push(SettingsError::MissingApiKey);
    }

    if !is_language(&self.language) {
      errors.push(SettingsError::InvalidLanguage(self.language.clone()));
    }

    if errors.is_empty() {
      Ok(())
    } else {
      Err(errors)
    }
  }

  /// True once an endpoint and credential have been configured.
  pub fn is_configured(&self) -> bool {
    !self.redmine_url.is_empty() && !self.redmine_api_key.is_empty()
  }

  /// Copy with the API key masked, for display.
  pub fn redacted(&self) -> Self {
    let chars: Vec<char> = self.redmine_api_key.chars().collect();
    let masked = match chars.len() {
      n if n <= 4 => "*".repeat(n),
      n => {
        let tail: String = chars[n - 4..].iter().collect();
        format!("{}{}", "*".repeat(n - 4), tail)
      }
    };
    Self {
      redmine_api_key: masked,
      ..self.clone()
    }
  }
}

/// `"browser"` or a simple language tag such as `de` or `pt-BR`.
fn is_language(language: &str) -> bool {
  if language == BROWSER_LANGUAGE {
    return true;
  }
  let mut parts = language.split(['-', '_']);
  let primary_ok = parts
    .next()
    .is_some_and(|p| (2..=3).contains(&p.len()) && p.chars().all(|c| c.is_ascii_alphabetic()));
  primary_ok && parts.all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// The settings binding. Every context opens its own; they converge through storage.
#[derive(Clone)]
pub struct SettingsStore {
  binding: StorageBinding<Settings>,
}

impl SettingsStore {
  pub fn open(store: KvStore) -> Self {
    Self {
      binding: StorageBinding::new(store, SETTINGS_KEY, Settings::default()),
    }
  }

  pub async fn read(&self) -> Settings {
    self.binding.read().await
  }

  /// Replace the stored settings as a whole.
  pub fn write(&self, settings: &Settings) {
    self.binding.write(settings);
  }

  /// Drop the stored settings so every context falls back to defaults.
  pub fn reset(&self) {
    self.binding.reset();
  }

  pub async fn flush(&self) {
    self.binding.flush().await;
  }

  pub fn subscribe<F>(&self, on_change: F) -> Subscription
  where
    F: Fn(Settings) + Send + Sync + 'static,
  {
    self.binding.subscribe(on_change)
  }

  pub fn live(&self) -> LiveValue<Settings> {
    self.binding.live()
  }

  pub fn binding(&self) -> &StorageBinding<Settings> {
    &self.binding
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::{MemoryBackend, MemoryService};

  fn valid() -> Settings {
    Settings {
      redmine_url: "https://example.com".to_string(),
      redmine_api_key: "0123456789abcdef".to_string(),
      ..Settings::default()
    }
  }

  #[test]
  fn test_default_shape() {
    let json = serde_json::to_value(Settings::default()).unwrap();
    assert_eq!(
      json,
      serde_json::json!({
        "redmineURL": "",
        "redmineApiKey": "",
        "language": "browser",
        "options": {
          "autoPauseOnSwitch": false,
          "extendedSearch": false,
          "roundTimeNearestQuarterHour": false
        }
      })
    );
  }

  #[test]
  fn test_missing_fields_take_defaults() {
    let settings: Settings =
      serde_json::from_str(r#"{"redmineURL":"https://r.example","options":{"extendedSearch":true}}"#)
        .unwrap();
    assert_eq!(settings.redmine_url, "https://r.example");
    assert_eq!(settings.language, "browser");
    assert!(settings.options.extended_search);
    assert!(!settings.options.auto_pause_on_switch);
  }

  #[test]
  fn test_validate() {
    assert_eq!(valid().validate(), Ok(()));

    let errors = Settings::default().validate().unwrap_err();
    assert_eq!(
      errors,
      vec![SettingsError::MissingUrl, SettingsError::MissingApiKey]
    );

    let bad = Settings {
      redmine_url: "ftp://example.com".to_string(),
      language: "not a language".to_string(),
      ..valid()
    };
    let errors = bad.validate().unwrap_err();
    assert!(matches!(errors[0], SettingsError::InvalidUrl(_)));
    assert!(matches!(errors[1], SettingsError::InvalidLanguage(_)));

    let with_port = Settings {
      redmine_url: "http://localhost:3000/redmine".to_string(),
      language: "pt-BR".to_string(),
      ..valid()
    };
    assert_eq!(with_port.validate(), Ok(()));
  }

  #[test]
  fn test_redacted_keeps_last_four() {
    assert_eq!(valid().redacted().redmine_api_key, "************cdef");
    assert_eq!(Settings::default().redacted().redmine_api_key, "");
  }

  #[tokio::test]
  async fn test_fresh_store_reads_defaults() {
    let settings = SettingsStore::open(KvStore::new(MemoryBackend::new()));
    assert_eq!(settings.read().await, Settings::default());
  }

  #[tokio::test]
  async fn test_save_reaches_open_subscriber() {
    let service = MemoryService::new();
    let options_page = SettingsStore::open(KvStore::new(service.connect()));
    let popup = SettingsStore::open(KvStore::new(service.connect()));

    let mut live = popup.live();
    assert_eq!(live.wait_until(|_| true).await, Some(Settings::default()));

    options_page.write(&valid());

    let seen = live
      .wait_until(|s| s.redmine_url == "https://example.com")
      .await;
    assert_eq!(seen, Some(valid()));
  }

  #[tokio::test]
  async fn test_reset_restores_defaults() {
    let settings = SettingsStore::open(KvStore::new(MemoryBackend::new()));
    settings.write(&valid());
    assert_eq!(settings.read().await, valid());

    settings.reset();
    assert_eq!(settings.read().await, Settings::default());
  }
}
