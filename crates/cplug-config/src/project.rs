//! Project Configuration (cplug.toml)
//!
//! Handles project-level configuration stored in `cplug.toml` at the project root.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Open-mode names accepted in `loader.mode`
pub const OPEN_MODE_NAMES: &[&str] = &["lazy", "now", "global", "local", "noload", "nodelete"];

/// Project configuration from cplug.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Library loading settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loader: Option<LoaderConfig>,

    /// Logging settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Library loading configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoaderConfig {
    /// Directories searched for short library names, in priority order
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,

    /// Open mode flags (e.g. `["now", "global"]`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Vec<String>>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Minimum level ("trace", "debug", "info", "warn", "error")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Output format ("pretty", "compact", "json")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Extra filter directives (e.g. "cplug_runtime=trace")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl ProjectConfig {
    /// Load project configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the project configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(loader) = &self.loader {
            loader.validate("loader")?;
        }
        if let Some(logging) = &self.logging {
            logging.validate("logging")?;
        }
        Ok(())
    }

    /// Open mode, if configured
    pub fn open_mode(&self) -> Option<&[String]> {
        self.loader.as_ref().and_then(|l| l.mode.as_deref())
    }

    /// Merge another project config into this one
    /// Other config takes precedence for non-None values
    pub fn merge(&mut self, other: &ProjectConfig) {
        if other.loader.is_some() {
            self.loader = other.loader.clone();
        }
        if other.logging.is_some() {
            self.logging = other.logging.clone();
        }
    }
}

impl LoaderConfig {
    pub(crate) fn validate(&self, section: &str) -> ConfigResult<()> {
        if let Some(mode) = &self.mode {
            validate_open_mode(&format!("{}.mode", section), mode)?;
        }
        for path in &self.search_paths {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.search_paths", section),
                    reason: "path cannot be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl LoggingConfig {
    pub(crate) fn validate(&self, section: &str) -> ConfigResult<()> {
        if let Some(level) = &self.level {
            if !is_valid_level(level) {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.level", section),
                    reason: format!(
                        "must be 'trace', 'debug', 'info', 'warn', or 'error', got '{}'",
                        level
                    ),
                });
            }
        }
        if let Some(format) = &self.format {
            if !matches!(format.as_str(), "pretty" | "compact" | "json") {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.format", section),
                    reason: format!("must be 'pretty', 'compact', or 'json', got '{}'", format),
                });
            }
        }
        Ok(())
    }
}

/// Validate a list of open-mode names
///
/// `lazy` and `now` are mutually exclusive, as are `global` and `local`.
pub fn validate_open_mode(field: &str, mode: &[String]) -> ConfigResult<()> {
    for name in mode {
        if !OPEN_MODE_NAMES.contains(&name.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                reason: format!(
                    "unknown open mode '{}' (expected one of {})",
                    name,
                    OPEN_MODE_NAMES.join(", ")
                ),
            });
        }
    }

    let has = |n: &str| mode.iter().any(|m| m == n);
    if has("lazy") && has("now") {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: "'lazy' and 'now' cannot be combined".to_string(),
        });
    }
    if has("global") && has("local") {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: "'global' and 'local' cannot be combined".to_string(),
        });
    }
    Ok(())
}

fn is_valid_level(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error")
}
