//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Hard ceiling on rows returned per execution
pub const DEFAULT_MAX_LIMIT: u64 = 1000;
/// Rows returned when neither the query nor the options set a limit
pub const DEFAULT_LIMIT: u64 = 100;
/// Offsets beyond this are clamped
pub const DEFAULT_MAX_OFFSET: u64 = 1_000_000;
/// Execution window
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Lifetime of cached results
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;
/// Upper bound on cached results kept in memory
pub const DEFAULT_CACHE_MAX_ENTRIES: u64 = 10_000;
/// Executions running against data sources at once
pub const DEFAULT_MAX_CONCURRENT_EXECUTIONS: usize = 64;
pub const DEFAULT_MAX_FILTER_DEPTH: usize = 8;
pub const DEFAULT_MAX_FILTER_BREADTH: usize = 64;
pub const DEFAULT_MAX_FILTER_PREDICATES: usize = 256;

const ENV_PREFIX: &str = "TEMPS_QUERY_";

// Helper functions for serde defaults
fn default_max_limit() -> u64 {
    DEFAULT_MAX_LIMIT
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_max_offset() -> u64 {
    DEFAULT_MAX_OFFSET
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn default_cache_max_entries() -> u64 {
    DEFAULT_CACHE_MAX_ENTRIES
}

fn default_max_concurrent_executions() -> usize {
    DEFAULT_MAX_CONCURRENT_EXECUTIONS
}

fn default_max_filter_depth() -> usize {
    DEFAULT_MAX_FILTER_DEPTH
}

fn default_max_filter_breadth() -> usize {
    DEFAULT_MAX_FILTER_BREADTH
}

fn default_max_filter_predicates() -> usize {
    DEFAULT_MAX_FILTER_PREDICATES
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {details}")]
    InvalidConfiguration { details: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidEnvValue { key: String, value: String },
}

/// Engine-wide limits and defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_limit")]
    pub max_limit: u64,

    #[serde(default = "default_limit")]
    pub default_limit: u64,

    #[serde(default = "default_max_offset")]
    pub max_offset: u64,

    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: u64,

    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,

    #[serde(default = "default_max_filter_depth")]
    pub max_filter_depth: usize,

    #[serde(default = "default_max_filter_breadth")]
    pub max_filter_breadth: usize,

    #[serde(default = "default_max_filter_predicates")]
    pub max_filter_predicates: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_limit: default_max_limit(),
            default_limit: default_limit(),
            max_offset: default_max_offset(),
            default_timeout_ms: default_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
            max_concurrent_executions: default_max_concurrent_executions(),
            max_filter_depth: default_max_filter_depth(),
            max_filter_breadth: default_max_filter_breadth(),
            max_filter_predicates: default_max_filter_predicates(),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `TEMPS_QUERY_*` environment variables,
    /// falling back to defaults for anything unset
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        read_var(&lookup, "MAX_LIMIT", &mut config.max_limit)?;
        read_var(&lookup, "DEFAULT_LIMIT", &mut config.default_limit)?;
        read_var(&lookup, "MAX_OFFSET", &mut config.max_offset)?;
        read_var(&lookup, "TIMEOUT_MS", &mut config.default_timeout_ms)?;
        read_var(&lookup, "CACHE_TTL_SECS", &mut config.cache_ttl_secs)?;
        read_var(&lookup, "CACHE_MAX_ENTRIES", &mut config.cache_max_entries)?;
        read_var(&lookup, "MAX_CONCURRENT", &mut config.max_concurrent_executions)?;
        read_var(&lookup, "MAX_FILTER_DEPTH", &mut config.max_filter_depth)?;
        read_var(&lookup, "MAX_FILTER_BREADTH", &mut config.max_filter_breadth)?;
        read_var(&lookup, "MAX_FILTER_PREDICATES", &mut config.max_filter_predicates)?;

        config.validate()?;
        Ok(config)
    }

    pub fn with_max_limit(mut self, max_limit: u64) -> Self {
        self.max_limit = max_limit;
        self
    }

    pub fn with_default_limit(mut self, default_limit: u64) -> Self {
        self.default_limit = default_limit;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = ttl.as_secs().max(1);
        self
    }

    pub fn with_max_concurrent_executions(mut self, max: usize) -> Self {
        self.max_concurrent_executions = max;
        self
    }

    pub fn with_filter_limits(mut self, depth: usize, breadth: usize, predicates: usize) -> Self {
        self.max_filter_depth = depth;
        self.max_filter_breadth = breadth;
        self.max_filter_predicates = predicates;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |details: &str| ConfigError::InvalidConfiguration {
            details: details.to_string(),
        };

        if self.max_limit == 0 {
            return Err(invalid("max_limit must be positive"));
        }
        if self.default_limit == 0 || self.default_limit > self.max_limit {
            return Err(invalid("default_limit must be within 1..=max_limit"));
        }
        if self.default_timeout_ms == 0 {
            return Err(invalid("default_timeout_ms must be positive"));
        }
        if self.cache_ttl_secs == 0 {
            return Err(invalid("cache_ttl_secs must be positive"));
        }
        if self.max_concurrent_executions == 0 {
            return Err(invalid("max_concurrent_executions must be positive"));
        }
        if self.max_filter_depth == 0 || self.max_filter_breadth == 0 {
            return Err(invalid("filter depth and breadth limits must be positive"));
        }

        Ok(())
    }
}

fn read_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    let key = format!("{}{}", ENV_PREFIX, name);
    if let Some(raw) = lookup(&key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnvValue { key, value: raw })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_limit, 1000);
        assert_eq!(config.default_timeout_ms, 30_000);
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({"max_limit": 500})).unwrap();
        assert_eq!(config.max_limit, 500);
        assert_eq!(config.default_limit, DEFAULT_LIMIT);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TEMPS_QUERY_MAX_LIMIT", "250"),
            ("TEMPS_QUERY_TIMEOUT_MS", " 5000 "),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.max_limit, 250);
        assert_eq!(config.default_timeout_ms, 5000);
        assert_eq!(config.cache_ttl_secs, DEFAULT_CACHE_TTL_SECS);
    }

    #[test]
    fn test_env_rejects_garbage() {
        let result = EngineConfig::from_lookup(|k| {
            (k == "TEMPS_QUERY_MAX_LIMIT").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidEnvValue { .. })));
    }

    #[test]
    fn test_validate_rejects_default_above_ceiling() {
        let config = EngineConfig::default().with_max_limit(10);
        assert!(config.validate().is_err());
    }
}
