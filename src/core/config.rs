//! Volume configuration
//!
//! Geometry (`block_size`, `attribute_size`) only matters when a volume is
//! created; an opened volume takes both from its header. The cache limits
//! apply to every session.

use crate::core::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

pub const DEFAULT_BLOCK_SIZE: u16 = 1024;
pub const DEFAULT_MAX_CACHED_DIRECTORIES: usize = 100;
pub const DEFAULT_MAX_CACHED_GROUP_HEADS: usize = 12800;
pub const DEFAULT_MAX_CACHED_GROUPS: usize = 64;
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4096;

/// Tunables for creating and opening a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Block size in bytes for new volumes (power of two)
    #[validate(range(min = 128, max = 1024))]
    pub block_size: u16,

    /// Bytes of user attributes stored in every inode for new volumes
    #[validate(range(max = 32))]
    pub attribute_size: u8,

    /// Loaded directories kept in memory before trimming kicks in
    #[validate(range(min = 1))]
    pub max_cached_directories: usize,

    /// Hot block groups kept loaded between transactions
    #[validate(range(min = 1))]
    pub max_cached_groups: usize,

    /// Width of the cold block-group head window
    #[validate(range(min = 50))]
    pub max_cached_group_heads: usize,

    /// Bytes of staged store writes before an automatic flush
    #[validate(range(min = 1024))]
    pub write_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            block_size: DEFAULT_BLOCK_SIZE,
            attribute_size: 0,
            max_cached_directories: DEFAULT_MAX_CACHED_DIRECTORIES,
            max_cached_groups: DEFAULT_MAX_CACHED_GROUPS,
            max_cached_group_heads: DEFAULT_MAX_CACHED_GROUP_HEADS,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
        }
    }
}

impl Config {
    /// Config with a specific geometry and default cache limits
    pub fn with_geometry(block_size: u16, attribute_size: u8) -> Self {
        Config {
            block_size,
            attribute_size,
            ..Config::default()
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Run field validation and convert failures into [`SlabError`](crate::SlabError)
    pub fn validate_all(&self) -> Result<()> {
        self.validate()?;
        Ok(())
    }

    /// Staged-write budget for a given block size
    pub fn effective_write_buffer(&self, block_size: u16) -> usize {
        self.write_buffer_size.max(block_size as usize * 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SlabError;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate_all().is_ok());
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.max_cached_group_heads, 12800);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml_str("block_size = 512\nattribute_size = 4\n").unwrap();
        assert_eq!(config.block_size, 512);
        assert_eq!(config.attribute_size, 4);
        assert_eq!(config.max_cached_directories, DEFAULT_MAX_CACHED_DIRECTORIES);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = Config::from_toml_str("attribute_size = 40\n").unwrap_err();
        assert!(matches!(err, SlabError::ConfigValidation(_)));

        let err = Config::from_toml_str("block_size = 64\n").unwrap_err();
        assert!(matches!(err, SlabError::ConfigValidation(_)));

        let err = Config::from_toml_str("max_cached_groups = 0\n").unwrap_err();
        assert!(matches!(err, SlabError::ConfigValidation(_)));
    }

    #[test]
    fn test_bad_toml_rejected() {
        let err = Config::from_toml_str("block_size = \"big\"").unwrap_err();
        assert!(matches!(err, SlabError::ConfigParse(_)));
    }

    #[test]
    fn test_effective_write_buffer() {
        let config = Config::default();
        assert_eq!(config.effective_write_buffer(1024), 8192);
        assert_eq!(config.effective_write_buffer(128), 4096);
    }
}
