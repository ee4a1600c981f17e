//! Configuration management for the sync layer.

use std::env;
use std::time::Duration;

/// Default number of entities per page.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Sync configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Page size for new collections
    pub page_size: usize,
    /// Deadline raced against remote mutations
    pub mutation_timeout: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            mutation_timeout: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let page_size = lookup("LIVELIST_PAGE_SIZE")
            .unwrap_or_else(|| DEFAULT_PAGE_SIZE.to_string())
            .parse::<usize>()
            .ok()
            .filter(|size| *size > 0)
            .ok_or(ConfigError::InvalidPageSize)?;

        let mutation_timeout = lookup("LIVELIST_MUTATION_TIMEOUT_MS")
            .map(|ms| {
                ms.parse::<u64>()
                    .ok()
                    .filter(|ms| *ms > 0)
                    .map(Duration::from_millis)
                    .ok_or(ConfigError::InvalidTimeout)
            })
            .transpose()?;

        Ok(Self {
            page_size,
            mutation_timeout,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("LIVELIST_PAGE_SIZE must be a positive integer")]
    InvalidPageSize,

    #[error("LIVELIST_MUTATION_TIMEOUT_MS must be a positive number of milliseconds")]
    InvalidTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn parse_values() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("LIVELIST_PAGE_SIZE", "50"),
            ("LIVELIST_MUTATION_TIMEOUT_MS", "1500"),
        ]))
        .unwrap();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.mutation_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn reject_invalid_values() {
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[("LIVELIST_PAGE_SIZE", "0")])),
            Err(ConfigError::InvalidPageSize)
        ));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[("LIVELIST_PAGE_SIZE", "twenty")])),
            Err(ConfigError::InvalidPageSize)
        ));
        assert!(matches!(
            SyncConfig::from_lookup(lookup(&[("LIVELIST_MUTATION_TIMEOUT_MS", "soon")])),
            Err(ConfigError::InvalidTimeout)
        ));
    }
}
