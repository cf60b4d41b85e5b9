//! Store configuration, loaded from JSON.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::{
    bucket::DEFAULT_PADDING_BLOCK_SIZE,
    fs::{DEFAULT_DISK_CHECK_INTERVAL, GeneratorError},
};

pub const DEFAULT_PREFIX: &str = "temp-";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Encryption is enabled but no master secret was supplied")]
    MissingMasterSecret,

    #[error("Failed to prepare temp directory: {0}")]
    Generator(#[from] GeneratorError),
}

/// Settings for one bucket store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Managed directory for bucket files
    pub temp_dir: PathBuf,
    /// Filename prefix of managed files
    pub prefix: String,
    /// Delete stale managed files at startup
    pub wipe_on_startup: bool,
    /// Wrap buckets in padding and AEAD encryption
    pub encrypt: bool,
    /// Padding block size in bytes; 0 disables padding
    pub padding_block_size: u64,
    /// Overwrite files before deleting them
    pub secure_delete: bool,
    /// Bytes that must stay free on the filesystem; 0 disables the check
    pub min_free_space: u64,
    /// Bytes written between two disk-space checks
    pub disk_check_interval: u64,
    /// Preallocate files to their expected size
    pub preallocate: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("oxbucket"),
            prefix: DEFAULT_PREFIX.to_string(),
            wipe_on_startup: true,
            encrypt: false,
            padding_block_size: DEFAULT_PADDING_BLOCK_SIZE,
            secure_delete: false,
            min_free_space: 0,
            disk_check_interval: DEFAULT_DISK_CHECK_INTERVAL,
            preallocate: true,
        }
    }
}

impl StoreConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        let config = Self::from_json(&contents)?;
        info!(path = %path.display(), "Loaded store config");
        Ok(config)
    }

    /// Parse and validate JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.is_empty() {
            return Err(ConfigError::Invalid {
                field: "prefix",
                reason: "must not be empty".to_string(),
            });
        }
        if self.prefix.contains(['/', '\\']) {
            return Err(ConfigError::Invalid {
                field: "prefix",
                reason: format!("{:?} contains a path separator", self.prefix),
            });
        }
        if self.padding_block_size != 0 && !self.padding_block_size.is_power_of_two() {
            return Err(ConfigError::Invalid {
                field: "padding_block_size",
                reason: format!("{} is not a power of two", self.padding_block_size),
            });
        }
        if self.padding_block_size > u64::from(u32::MAX) {
            return Err(ConfigError::Invalid {
                field: "padding_block_size",
                reason: "exceeds 4 GiB".to_string(),
            });
        }
        if self.disk_check_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "disk_check_interval",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
