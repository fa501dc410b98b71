//! Storage configuration.
//!
//! [`StorageConfig`] bundles the knobs of the block allocator, the buffer and
//! the bracket index. It can be built in code with the `with_*` methods or
//! loaded from TOML:
//!
//! ```rust
//! use bracket_common::config::StorageConfig;
//!
//! let config = StorageConfig::from_toml_str(r#"
//!     block_size = 1024
//!     initial_blocks = 16
//!     extension_ratio = 0.5
//! "#).unwrap();
//! assert_eq!(config.extension_blocks(), 8);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_FRAMES, DEFAULT_EXTENSION_RATIO,
    DEFAULT_EXTERNALIZE_FRACTION, DEFAULT_INITIAL_BLOCKS, DEFAULT_SPLIT_OCCUPANCY, MIN_BLOCK_SIZE,
};
use crate::error::{DbError, DbResult};

/// Storage engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding container data and metadata files.
    pub data_dir: PathBuf,

    /// Block (and page) size in bytes.
    pub block_size: usize,

    /// Number of blocks a new container starts with.
    pub initial_blocks: u32,

    /// Growth step as a fraction of `initial_blocks`.
    pub extension_ratio: f64,

    /// Number of page frames held by the buffer manager.
    pub buffer_frames: usize,

    /// Values longer than `usable page space / externalize_fraction` go to blob pages.
    pub externalize_fraction: usize,

    /// Target fill of the left page after an occupancy split.
    pub split_occupancy: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            block_size: DEFAULT_BLOCK_SIZE,
            initial_blocks: DEFAULT_INITIAL_BLOCKS,
            extension_ratio: DEFAULT_EXTENSION_RATIO,
            buffer_frames: DEFAULT_BUFFER_FRAMES,
            externalize_fraction: DEFAULT_EXTERNALIZE_FRACTION,
            split_occupancy: DEFAULT_SPLIT_OCCUPANCY,
        }
    }
}

impl StorageConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a small configuration for tests: tiny pages force splits early.
    #[must_use]
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            block_size: 512,
            initial_blocks: 16,
            extension_ratio: 0.5,
            buffer_frames: 64,
            externalize_fraction: DEFAULT_EXTERNALIZE_FRACTION,
            split_occupancy: DEFAULT_SPLIT_OCCUPANCY,
        }
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Sets the block size.
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the initial number of blocks.
    #[must_use]
    pub fn with_initial_blocks(mut self, blocks: u32) -> Self {
        self.initial_blocks = blocks;
        self
    }

    /// Sets the extension ratio.
    #[must_use]
    pub fn with_extension_ratio(mut self, ratio: f64) -> Self {
        self.extension_ratio = ratio;
        self
    }

    /// Sets the buffer frame capacity.
    #[must_use]
    pub fn with_buffer_frames(mut self, frames: usize) -> Self {
        self.buffer_frames = frames;
        self
    }

    /// Sets the split occupancy target.
    #[must_use]
    pub fn with_split_occupancy(mut self, occupancy: f64) -> Self {
        self.split_occupancy = occupancy.clamp(0.1, 0.9);
        self
    }

    /// Number of blocks added by one extension step (at least one).
    #[must_use]
    pub fn extension_blocks(&self) -> u32 {
        extension_blocks(self.initial_blocks, self.extension_ratio)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> DbResult<()> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(DbError::invalid_config(format!(
                "block_size {} is below the minimum of {MIN_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if self.block_size > u16::MAX as usize + 1 {
            return Err(DbError::invalid_config(format!(
                "block_size {} exceeds 64 KiB",
                self.block_size
            )));
        }
        if self.initial_blocks < 2 {
            return Err(DbError::invalid_config(
                "initial_blocks must be at least 2 (block 0 is reserved)",
            ));
        }
        if self.extension_ratio.is_nan() || self.extension_ratio <= 0.0 {
            return Err(DbError::invalid_config("extension_ratio must be positive"));
        }
        if self.buffer_frames < 8 {
            return Err(DbError::invalid_config("buffer_frames must be at least 8"));
        }
        if self.externalize_fraction < 2 {
            return Err(DbError::invalid_config(
                "externalize_fraction must be at least 2",
            ));
        }
        Ok(())
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> DbResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| DbError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> DbResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> DbResult<String> {
        toml::to_string(self).map_err(|e| DbError::invalid_config(e.to_string()))
    }
}

/// Extension step for a space created with `initial_blocks` and `ratio`.
#[must_use]
pub fn extension_blocks(initial_blocks: u32, ratio: f64) -> u32 {
    ((f64::from(initial_blocks) * ratio) as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_extension_blocks() {
        assert_eq!(extension_blocks(16, 0.5), 8);
        assert_eq!(extension_blocks(3, 0.1), 1);
        assert_eq!(StorageConfig::for_testing("/tmp/x").extension_blocks(), 8);
    }

    #[test]
    fn test_config_validation() {
        let config = StorageConfig::default().with_block_size(64);
        assert!(config.validate().is_err());

        let config = StorageConfig::default().with_initial_blocks(1);
        assert!(config.validate().is_err());

        let config = StorageConfig::default().with_extension_ratio(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = StorageConfig::for_testing("/var/lib/bracket").with_split_occupancy(0.6);
        let text = config.to_toml_string().unwrap();
        let parsed = StorageConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        std::fs::write(&path, "block_size = 2048\nbuffer_frames = 32\n").unwrap();

        let config = StorageConfig::from_file(&path).unwrap();
        assert_eq!(config.block_size, 2048);
        assert_eq!(config.buffer_frames, 32);
        assert_eq!(config.initial_blocks, DEFAULT_INITIAL_BLOCKS);
    }

    #[test]
    fn test_rejects_bad_toml() {
        assert!(StorageConfig::from_toml_str("block_size = \"big\"").is_err());
    }
}
