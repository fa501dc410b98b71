//! Log configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// File name of the log inside [`LogConfig::dir`].
pub const LOG_FILE_NAME: &str = "bracket.log";

/// Configuration for the log manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory holding the log file.
    pub dir: PathBuf,

    /// Fsync the log file on every flush (commit, WAL-rule write-back).
    pub sync_on_commit: bool,

    /// Keep the log in memory only. Records survive only as long as the manager.
    pub in_memory: bool,

    /// Records larger than this are rejected.
    pub max_record_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/log"),
            sync_on_commit: true,
            in_memory: false,
            max_record_size: 16 * 1024 * 1024,
        }
    }
}

impl LogConfig {
    /// Creates a file-backed configuration for the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Creates an in-memory configuration.
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            sync_on_commit: false,
            ..Default::default()
        }
    }

    /// Creates a configuration for tests: file-backed, no fsync.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sync_on_commit: false,
            in_memory: false,
            max_record_size: 1024 * 1024,
        }
    }

    /// Sets the log directory.
    #[must_use]
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Enables or disables fsync on flush.
    #[must_use]
    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Sets the maximum record size.
    #[must_use]
    pub fn with_max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = size;
        self
    }

    /// Path of the log file.
    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE_NAME)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_record_size < 256 {
            return Err("max_record_size must be at least 256 bytes".into());
        }
        if !self.in_memory && self.dir.as_os_str().is_empty() {
            return Err("dir must be set for a file-backed log".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert!(config.sync_on_commit);
        assert!(!config.in_memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = LogConfig::new("/tmp/log")
            .with_sync_on_commit(false)
            .with_max_record_size(4096);
        assert_eq!(config.log_path(), PathBuf::from("/tmp/log").join(LOG_FILE_NAME));
        assert!(!config.sync_on_commit);
        assert_eq!(config.max_record_size, 4096);
    }

    #[test]
    fn test_validation() {
        assert!(LogConfig::in_memory().with_max_record_size(16).validate().is_err());
        assert!(LogConfig::new("").validate().is_err());
        assert!(LogConfig::in_memory().with_dir("").validate().is_ok());
    }
}
