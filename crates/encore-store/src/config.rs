//! Tunables for the cache, the batch writer and the maintenance task.
//!
//! [`StoreConfig`] deserializes from TOML; every field is optional and
//! falls back to the defaults below.
//!
//! ```toml
//! cache_ttl_secs = 300
//! max_cache_entries = 10000
//! batch_size_limit = 50
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Configuration for a [`DocumentService`](crate::service::DocumentService).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Seconds an entry may go unaccessed before a sweep drops it.
    pub cache_ttl_secs: u64,
    /// Maximum entries per collection after a sweep.
    pub max_cache_entries: usize,
    /// Seconds between TTL / capacity sweeps.
    pub sweep_interval_secs: u64,
    /// Queue length that triggers an immediate flush.
    pub batch_size_limit: usize,
    /// Seconds between periodic flushes of all queues.
    pub batch_flush_interval_secs: u64,
    /// How many of the most recent values a flushed list keeps.
    pub history_keep_last: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            max_cache_entries: 10_000,
            sweep_interval_secs: 60,
            batch_size_limit: 50,
            batch_flush_interval_secs: 30,
            history_keep_last: 25,
        }
    }
}

impl StoreConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> StoreResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| StoreError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Reject settings that would make the cache or writer degenerate.
    pub fn validate(&self) -> StoreResult<()> {
        let zero = [
            ("cache_ttl_secs", self.cache_ttl_secs == 0),
            ("max_cache_entries", self.max_cache_entries == 0),
            ("sweep_interval_secs", self.sweep_interval_secs == 0),
            ("batch_size_limit", self.batch_size_limit == 0),
            ("batch_flush_interval_secs", self.batch_flush_interval_secs == 0),
            ("history_keep_last", self.history_keep_last == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(StoreError::Config(format!("{field} must be greater than zero")));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn batch_flush_interval(&self) -> Duration {
        Duration::from_secs(self.batch_flush_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = StoreConfig::from_toml_str("").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn partial_override() {
        let config = StoreConfig::from_toml_str("batch_size_limit = 5\nhistory_keep_last = 10").unwrap();
        assert_eq!(config.batch_size_limit, 5);
        assert_eq!(config.history_keep_last, 10);
        assert_eq!(config.max_cache_entries, 10_000);
    }

    #[test]
    fn zero_limit_is_rejected() {
        let err = StoreConfig::from_toml_str("batch_size_limit = 0").unwrap_err();
        assert!(matches!(err, StoreError::Config(msg) if msg.contains("batch_size_limit")));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encore.toml");
        std::fs::write(&path, "cache_ttl_secs = 60\n").unwrap();
        assert_eq!(StoreConfig::load(&path).unwrap().cache_ttl_secs, 60);
        assert!(StoreConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
