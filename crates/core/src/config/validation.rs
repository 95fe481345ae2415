//! Configuration validation rules.
//!
//! This module provides validation logic for `ClientConfig` values
//! after they have been loaded from environment, files, or defaults.

use thiserror::Error;

use crate::config::ClientConfig;
use crate::language;

/// Configuration validation errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

const MAX_MEMORY_CAPACITY: usize = 1_000_000;

/// One year.
const MAX_STALE_AFTER_SECS: u64 = 365 * 24 * 60 * 60;

impl ClientConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `memory_capacity` is 0 or exceeds 1,000,000 entries
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `user_agent` is empty
    /// - `default_language` is not a language code
    /// - `api_url` is not an http(s) URL
    /// - `device_id` is present but blank
    /// - `stale_after_secs` exceeds one year
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_capacity == 0 {
            return Err(ConfigError::Invalid { field: "memory_capacity".into(), reason: "must be greater than 0".into() });
        }
        if self.memory_capacity > MAX_MEMORY_CAPACITY {
            return Err(ConfigError::Invalid {
                field: "memory_capacity".into(),
                reason: format!("must not exceed {MAX_MEMORY_CAPACITY}"),
            });
        }

        if self.timeout_ms < 100 {
            return Err(ConfigError::Invalid { field: "timeout_ms".into(), reason: "must be at least 100ms".into() });
        }
        if self.timeout_ms > 300_000 {
            return Err(ConfigError::Invalid {
                field: "timeout_ms".into(),
                reason: "must not exceed 5 minutes (300000ms)".into(),
            });
        }

        if self.stale_after_secs > MAX_STALE_AFTER_SECS {
            return Err(ConfigError::Invalid {
                field: "stale_after_secs".into(),
                reason: format!("must not exceed {MAX_STALE_AFTER_SECS} (one year)"),
            });
        }

        if self.user_agent.is_empty() {
            return Err(ConfigError::Invalid { field: "user_agent".into(), reason: "must not be empty".into() });
        }

        if !language::is_valid(&self.default_language) {
            return Err(ConfigError::Invalid {
                field: "default_language".into(),
                reason: format!("'{}' is not a language code", self.default_language),
            });
        }

        match url::Url::parse(&self.api_url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => {
                return Err(ConfigError::Invalid {
                    field: "api_url".into(),
                    reason: format!("unsupported scheme: {}", parsed.scheme()),
                });
            }
            Err(e) => return Err(ConfigError::Invalid { field: "api_url".into(), reason: e.to_string() }),
        }

        if let Some(device_id) = &self.device_id
            && device_id.trim().is_empty()
        {
            return Err(ConfigError::Invalid { field: "device_id".into(), reason: "must not be blank".into() });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_capacity() {
        let config = ClientConfig { memory_capacity: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "memory_capacity"));
    }

    #[test]
    fn test_validate_capacity_exceeds_limit() {
        let config = ClientConfig { memory_capacity: MAX_MEMORY_CAPACITY + 1, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "memory_capacity"));
    }

    #[test]
    fn test_validate_timeout_bounds() {
        let too_small = ClientConfig { timeout_ms: 50, ..Default::default() };
        assert!(matches!(too_small.validate(), Err(ConfigError::Invalid { field, .. }) if field == "timeout_ms"));

        let too_large = ClientConfig { timeout_ms: 301_000, ..Default::default() };
        assert!(matches!(too_large.validate(), Err(ConfigError::Invalid { field, .. }) if field == "timeout_ms"));
    }

    #[test]
    fn test_validate_stale_after_bounds() {
        let config = ClientConfig { stale_after_secs: u64::MAX, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field, .. }) if field == "stale_after_secs"));

        let config = ClientConfig { stale_after_secs: MAX_STALE_AFTER_SECS, ..Default::default() };
        assert!(config.validate().is_ok());
        let config = ClientConfig { stale_after_secs: 0, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bad_language() {
        let config = ClientConfig { default_language: "english!".into(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "default_language"));
    }

    #[test]
    fn test_validate_api_url_scheme() {
        let config = ClientConfig { api_url: "ftp://strings.example.com".into(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "api_url"));

        let config = ClientConfig { api_url: "not a url".into(), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_blank_device_id() {
        let config = ClientConfig { device_id: Some("   ".into()), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "device_id"));
    }

    #[test]
    fn test_validate_edge_case_values() {
        let config = ClientConfig { memory_capacity: 1, timeout_ms: 100, ..Default::default() };
        assert!(config.validate().is_ok());

        let config = ClientConfig { memory_capacity: MAX_MEMORY_CAPACITY, timeout_ms: 300_000, ..Default::default() };
        assert!(config.validate().is_ok());
    }
}
