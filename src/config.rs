//! TOML configuration for segment images and the `segctl` tool.
//!
//! ```toml
//! [segment]
//! size = 4194304
//!
//! [allocator]
//! check_invariants = true
//! stats_boundary = 512
//!
//! [btree]
//! fanout = 8
//!
//! [tx]
//! max_reg_nr = 65536
//! ```
//!
//! Every section and key is optional; missing ones take their defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admin::AdminOpenOptions;
use crate::primitives::tx::TxOptions;
use crate::storage::alloc::AllocatorOptions;
use crate::storage::btree::BTreeOptions;

/// Default segment size for newly formatted images.
pub const DEFAULT_SEGMENT_SIZE: u64 = 4 << 20;

/// `[segment]` section.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Size in bytes of newly formatted images.
    pub size: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

/// Whole configuration file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Segment sizing.
    pub segment: SegmentConfig,
    /// Allocator checks and statistics.
    pub allocator: AllocatorOptions,
    /// Tree shape and checks.
    pub btree: BTreeOptions,
    /// Transaction limits.
    pub tx: TxOptions,
}

impl StoreConfig {
    /// Loads `explicit`, or the per-user default file when none is given.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) if !path.exists() => Err(ConfigError::Missing { path }),
            Some(path) => read_file(&path),
            None => match default_config_path() {
                Some(path) if path.exists() => read_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parses configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Options for opening or formatting images.
    pub fn admin_options(&self) -> AdminOpenOptions {
        AdminOpenOptions {
            allocator: self.allocator.clone(),
            btree: self.btree.clone(),
            tx: self.tx.clone(),
        }
    }
}

fn read_file(path: &Path) -> Result<StoreConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = StoreConfig::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(target: "segstore::config", path = %path.display(), "loaded configuration");
    Ok(config)
}

/// Per-user configuration file location.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("segstore").join("segctl.toml"))
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly named file does not exist.
    #[error("config file {path} does not exist")]
    Missing {
        /// File that was asked for.
        path: PathBuf,
    },
    /// The file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid configuration TOML.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File being parsed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The configuration could not be rendered.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
}
