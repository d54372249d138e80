//! Configuration for node contexts and the library handle.

use crate::error::Result;
use lfcs_core::TableConfig;
use lfcs_mem::{HazardConfig, PoolConfig};
use serde::{Deserialize, Serialize};

/// Resources a node context allocates for itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Pool backing the node's set entries.
    pub pool: PoolConfig,
    /// Hazard domain guarding the node's sets.
    pub hazard: HazardConfig,
    /// Bucket table sizing for sets created by the node.
    pub table: TableConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default()
                .with_block_size(128)
                .with_initial_blocks(4096),
            hazard: HazardConfig::default(),
            table: TableConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.hazard.validate()?;
        self.table.validate()?;
        Ok(())
    }
}

/// Builder for node configuration.
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
        }
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.config.pool.block_size = bytes;
        self
    }

    pub fn initial_blocks(mut self, blocks: usize) -> Self {
        self.config.pool.initial_blocks = blocks;
        self
    }

    pub fn max_blocks(mut self, blocks: usize) -> Self {
        self.config.pool.max_blocks = blocks;
        self
    }

    pub fn max_threads(mut self, threads: usize) -> Self {
        self.config.hazard.max_threads = threads;
        self
    }

    pub fn reclaim_threshold(mut self, retired: usize) -> Self {
        self.config.hazard.reclaim_threshold = retired;
        self
    }

    pub fn initial_buckets(mut self, buckets: usize) -> Self {
        self.config.table.initial_buckets = buckets;
        self
    }

    pub fn max_load_factor(mut self, factor: f64) -> Self {
        self.config.table.max_load_factor = factor;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<NodeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for NodeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a [`Library`](crate::Library).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Applied to every node context the library creates.
    pub node: NodeConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.pool.block_size, 128);
        assert_eq!(config.pool.initial_blocks, 4096);
        assert_eq!(config.hazard.max_threads, 128);
        assert_eq!(config.table.initial_buckets, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = NodeConfigBuilder::new()
            .block_size(256)
            .initial_blocks(16)
            .max_threads(8)
            .initial_buckets(4)
            .build()
            .unwrap();
        assert_eq!(config.pool.block_size, 256);
        assert_eq!(config.hazard.max_threads, 8);
        assert_eq!(config.table.initial_buckets, 4);
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(NodeConfigBuilder::new().max_threads(0).build().is_err());
        assert!(NodeConfigBuilder::new().max_load_factor(-1.0).build().is_err());
    }

    #[test]
    fn test_config_json() {
        let config = LibraryConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: LibraryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
