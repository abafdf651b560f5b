//! cplug configuration
//!
//! Configuration for loading native libraries and for runtime logging:
//! - Project configuration (cplug.toml)
//! - Global user configuration (~/.cplug/config.toml)
//! - Environment overrides (CPLUG_*)
//!
//! # Configuration Hierarchy
//!
//! Sources are merged in the following order (later overrides earlier):
//! 1. Global config (~/.cplug/config.toml)
//! 2. Project config (./cplug.toml, found by walking up the directory tree)
//! 3. Environment variables (CPLUG_LIBRARY_PATH, CPLUG_OPEN_MODE, CPLUG_LOG)
//!
//! # Example
//!
//! ```no_run
//! use cplug_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("{:?}", config.search_paths());
//! ```

pub mod global;
pub mod loader;
pub mod project;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

pub use global::GlobalConfig;
pub use loader::{Config, ConfigLoader};
pub use project::{LoaderConfig, LoggingConfig, ProjectConfig};
