//! Client configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (STRINGBOOT_*)
//! 2. TOML config file (if STRINGBOOT_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Client configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (STRINGBOOT_*)
/// 2. TOML config file (if STRINGBOOT_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the delta-sync API.
    ///
    /// Set via STRINGBOOT_API_URL environment variable.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Bearer token for the delta-sync API.
    ///
    /// Set via STRINGBOOT_API_TOKEN environment variable.
    /// Required only when the HTTP delta source is constructed.
    #[serde(default)]
    pub api_token: Option<String>,

    /// Path to the SQLite local store.
    ///
    /// Set via STRINGBOOT_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Language used at startup and as the fallback tier.
    #[serde(default = "default_language")]
    pub default_language: String,

    /// Whether a key missing in the active language falls back to `default_language`.
    #[serde(default = "default_true")]
    pub fallback_to_default: bool,

    /// Maximum number of resolved strings held in memory.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,

    /// HTTP request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// User-Agent string for HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Host-provided device identifier. Only honored on first install.
    #[serde(default)]
    pub device_id: Option<String>,

    /// Whether a read miss may trigger a sync of a never-synced or stale language.
    #[serde(default = "default_true")]
    pub sync_on_miss: bool,

    /// Age after which a language's cursor counts as stale.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_api_url() -> String {
    "https://api.stringboot.com".into()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./stringboot.sqlite")
}

fn default_language() -> String {
    "en".into()
}

fn default_memory_capacity() -> usize {
    1000
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_user_agent() -> String {
    "stringboot-rs/0.1".into()
}

fn default_stale_after_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_token: None,
            db_path: default_db_path(),
            default_language: default_language(),
            fallback_to_default: true,
            memory_capacity: default_memory_capacity(),
            timeout_ms: default_timeout_ms(),
            user_agent: default_user_agent(),
            device_id: None,
            sync_on_miss: true,
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl ClientConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Staleness threshold as a chrono duration, for comparison against cursor timestamps.
    pub fn stale_after(&self) -> chrono::Duration {
        i64::try_from(self.stale_after_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `STRINGBOOT_`
    /// 2. TOML file from `STRINGBOOT_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("STRINGBOOT_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("STRINGBOOT_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Check if the API token is available (for deferred validation).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if the API token is not set.
    pub fn require_api_token(&self) -> Result<&str, ConfigError> {
        self.api_token.as_deref().ok_or_else(|| ConfigError::Missing {
            field: "api_token".into(),
            hint: "Set STRINGBOOT_API_TOKEN environment variable".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.api_url, "https://api.stringboot.com");
        assert_eq!(config.db_path, PathBuf::from("./stringboot.sqlite"));
        assert_eq!(config.default_language, "en");
        assert_eq!(config.memory_capacity, 1000);
        assert_eq!(config.timeout_ms, 10_000);
        assert!(config.fallback_to_default);
        assert!(config.sync_on_miss);
        assert!(config.device_id.is_none());
        assert!(config.api_token.is_none());
    }

    #[test]
    fn test_timeout_duration() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(10_000));
        assert_eq!(config.stale_after(), chrono::Duration::seconds(3600));
    }

    #[test]
    fn test_stale_after_saturates() {
        let config = ClientConfig { stale_after_secs: u64::MAX, ..Default::default() };
        assert_eq!(config.stale_after(), chrono::TimeDelta::MAX);

        let config = ClientConfig { stale_after_secs: i64::MAX as u64 / 100, ..Default::default() };
        assert_eq!(config.stale_after(), chrono::TimeDelta::MAX);
    }

    #[test]
    fn test_require_api_token_missing() {
        let config = ClientConfig::default();
        let result = config.require_api_token();
        assert!(matches!(result, Err(ConfigError::Missing { .. })));
    }

    #[test]
    fn test_require_api_token_present() {
        let config = ClientConfig { api_token: Some("sb_live_test".into()), ..Default::default() };
        assert_eq!(config.require_api_token().unwrap(), "sb_live_test");
    }

    #[test]
    fn test_load_from_toml_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "stringboot.toml",
                r#"
                default_language = "fr"
                memory_capacity = 64
                "#,
            )?;
            jail.set_env("STRINGBOOT_CONFIG_FILE", "stringboot.toml");
            jail.set_env("STRINGBOOT_MEMORY_CAPACITY", "128");

            let config = ClientConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.default_language, "fr");
            assert_eq!(config.memory_capacity, 128);
            Ok(())
        });
    }
}
