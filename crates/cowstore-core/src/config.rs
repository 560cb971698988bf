//! Engine configuration

use crate::{CoreError, Result};
use cowstore_blockstore::{DEFAULT_BLOCK_SIZE, HEADER_LEN, MAX_BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest accepted block size
pub const MIN_BLOCK_SIZE: usize = 256;

/// Prefix for environment overrides, e.g. `COWSTORE_BLOCK_SIZE=8192`
pub const ENV_PREFIX: &str = "COWSTORE";

/// Engine configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of every node block in bytes (power of two)
    pub block_size: usize,
    /// Nodes below this share of their budget are merged or refilled
    pub min_fill_percent: u8,
    /// Upper bound on children per branch
    pub max_fanout: usize,
    /// Target fill for nodes built by bulk loads
    pub bulk_fill_percent: u8,
    /// Run garbage collection after every committed container write and
    /// after dropping a snapshot
    pub auto_gc: bool,
    /// Byte capacity of the default in-memory store
    pub store_capacity: Option<u64>,
    /// Decoded blocks kept by the default store's cache (0 disables it)
    pub block_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            min_fill_percent: 25,
            max_fanout: 256,
            bulk_fill_percent: 90,
            auto_gc: true,
            store_capacity: None,
            block_cache_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Load defaults, then an optional config file, then `COWSTORE_*`
    /// environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Set the block size
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the minimum fill threshold
    pub fn with_min_fill_percent(mut self, percent: u8) -> Self {
        self.min_fill_percent = percent;
        self
    }

    /// Set the maximum branch fanout
    pub fn with_max_fanout(mut self, fanout: usize) -> Self {
        self.max_fanout = fanout;
        self
    }

    /// Enable or disable collection after writes and snapshot drops
    pub fn with_auto_gc(mut self, auto_gc: bool) -> Self {
        self.auto_gc = auto_gc;
        self
    }

    /// Bound the default store
    pub fn with_store_capacity(mut self, capacity: u64) -> Self {
        self.store_capacity = Some(capacity);
        self
    }

    /// Set the block cache size
    pub fn with_block_cache_capacity(mut self, capacity: usize) -> Self {
        self.block_cache_capacity = capacity;
        self
    }

    /// Check that the values describe a usable engine
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(CoreError::Configuration(format!(
                "block_size must be a power of two between {} and {}, got {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE, self.block_size
            )));
        }
        if !(1..=45).contains(&self.min_fill_percent) {
            return Err(CoreError::Configuration(format!(
                "min_fill_percent must be between 1 and 45, got {}",
                self.min_fill_percent
            )));
        }
        if !(50..=100).contains(&self.bulk_fill_percent) {
            return Err(CoreError::Configuration(format!(
                "bulk_fill_percent must be between 50 and 100, got {}",
                self.bulk_fill_percent
            )));
        }
        if self.max_fanout < 4 || self.max_fanout > u16::MAX as usize {
            return Err(CoreError::Configuration(format!(
                "max_fanout must be between 4 and {}, got {}",
                u16::MAX,
                self.max_fanout
            )));
        }
        Ok(())
    }

    /// Payload bytes available in one block
    pub fn node_budget(&self) -> usize {
        self.block_size - HEADER_LEN
    }

    /// Payload size below which a non-root node counts as underfull
    pub fn min_fill_bytes(&self) -> usize {
        self.node_budget() * self.min_fill_percent as usize / 100
    }

    /// Payload size bulk loads aim for
    pub fn bulk_fill_bytes(&self) -> usize {
        self.node_budget() * self.bulk_fill_percent as usize / 100
    }

    /// Largest encoded key an ordered container accepts
    ///
    /// A branch entry costs a 16-byte child id, two varints and the key;
    /// keeping that under a quarter of the budget guarantees every split
    /// leaves at least two entries per branch.
    pub fn max_key_len(&self) -> usize {
        self.node_budget() / 4 - 36
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.node_budget(), 4096 - 32);
        assert_eq!(config.min_fill_bytes(), (4096 - 32) / 4);
    }

    #[rstest]
    #[case(EngineConfig::default().with_block_size(1000))]
    #[case(EngineConfig::default().with_block_size(128))]
    #[case(EngineConfig::default().with_min_fill_percent(0))]
    #[case(EngineConfig::default().with_min_fill_percent(60))]
    #[case(EngineConfig::default().with_max_fanout(2))]
    fn test_rejects_bad_values(#[case] config: EngineConfig) {
        assert!(matches!(config.validate(), Err(CoreError::Configuration(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "block_size = 512\nauto_gc = false").unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.block_size, 512);
        assert!(!config.auto_gc);
        assert_eq!(config.max_fanout, 256);
    }

    #[test]
    fn test_load_rejects_invalid_file_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "block_size = 1000").unwrap();
        assert!(EngineConfig::load(Some(file.path())).is_err());
    }
}
