//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::global::GlobalConfig;
use crate::project::{validate_open_mode, LoggingConfig, ProjectConfig};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Project configuration file name
pub const PROJECT_CONFIG_FILE: &str = "cplug.toml";

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.cplug/config.toml) - lowest priority
/// 2. Project config (./cplug.toml) - overrides global
/// 3. Environment variables (CPLUG_*) - overrides project
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Project configuration (environment overrides already applied)
    pub project: ProjectConfig,

    /// Global configuration
    pub global: GlobalConfig,

    /// Project root directory (where cplug.toml was found)
    pub project_root: Option<PathBuf>,

    /// Search paths taken from CPLUG_LIBRARY_PATH
    pub env_search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use an explicit global config file instead of ~/.cplug/config.toml
    pub fn with_global_config_path(path: PathBuf) -> Self {
        Self {
            global_config_path: Some(path),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find cplug.toml, then loads and merges
    /// global config if it exists.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;
        let global_config = self.load_global_config()?;
        self.finish(project_config, global_config, project_root)
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project_config = ProjectConfig::load_from_file(config_path)?;
        let global_config = self.load_global_config()?;
        let project_root = config_path.parent().map(|p| p.to_path_buf());
        self.finish(project_config, global_config, project_root)
    }

    fn finish(
        &self,
        project: ProjectConfig,
        global: GlobalConfig,
        project_root: Option<PathBuf>,
    ) -> ConfigResult<Config> {
        let project = self.apply_env_overrides(project)?;
        let env_search_paths = env::var_os("CPLUG_LIBRARY_PATH")
            .map(|value| env::split_paths(&value).collect())
            .unwrap_or_default();

        Ok(Config {
            project,
            global,
            project_root,
            env_search_paths,
        })
    }

    /// Find project configuration by walking up directory tree
    ///
    /// Returns (project_root, project_config); a default config with no root
    /// when no cplug.toml exists anywhere above `start_dir`.
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, ProjectConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_CONFIG_FILE);

            if config_path.exists() {
                let project_config = ProjectConfig::load_from_file(&config_path)?;
                return Ok((Some(current), project_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, ProjectConfig::default())),
            }
        }
    }

    /// Load global configuration from ~/.cplug/config.toml
    ///
    /// A missing file (or home directory) yields the default; a malformed
    /// file is an error.
    fn load_global_config(&mut self) -> ConfigResult<GlobalConfig> {
        if self.global_config_path.is_none() {
            match GlobalConfig::global_config_path() {
                Ok(path) => self.global_config_path = Some(path),
                Err(ConfigError::HomeNotFound) => return Ok(GlobalConfig::default()),
                Err(e) => return Err(e),
            }
        }

        match &self.global_config_path {
            Some(path) if path.exists() => GlobalConfig::load_from_file(path),
            _ => Ok(GlobalConfig::default()),
        }
    }

    /// Apply environment variable overrides to project config
    ///
    /// - CPLUG_OPEN_MODE: comma separated open modes, replaces `loader.mode`
    /// - CPLUG_LOG: filter directives, replaces `logging.filter`
    fn apply_env_overrides(&self, mut config: ProjectConfig) -> ConfigResult<ProjectConfig> {
        if let Ok(mode) = env::var("CPLUG_OPEN_MODE") {
            let names: Vec<String> = mode
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            validate_open_mode("CPLUG_OPEN_MODE", &names)?;
            config.loader.get_or_insert_with(Default::default).mode = Some(names);
        }

        if let Ok(filter) = env::var("CPLUG_LOG") {
            config
                .logging
                .get_or_insert_with(LoggingConfig::default)
                .filter = Some(filter);
        }

        Ok(config)
    }

    /// Get the global configuration directory (~/.cplug)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".cplug"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Library search paths in priority order
    ///
    /// Environment paths first, then project paths (relative entries are
    /// resolved against the project root), then global paths.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.env_search_paths.clone();

        if let Some(loader) = &self.project.loader {
            for path in &loader.search_paths {
                match (&self.project_root, path.is_relative()) {
                    (Some(root), true) => paths.push(root.join(path)),
                    _ => paths.push(path.clone()),
                }
            }
        }

        if let Some(loader) = &self.global.loader {
            paths.extend(loader.search_paths.iter().cloned());
        }

        paths
    }

    /// Effective open mode (project > global > `["now"]`)
    pub fn open_mode(&self) -> Vec<String> {
        self.project
            .open_mode()
            .or_else(|| self.global.loader.as_ref().and_then(|l| l.mode.as_deref()))
            .map(|m| m.to_vec())
            .unwrap_or_else(|| vec!["now".to_string()])
    }

    /// Effective log level (project > global > "info")
    pub fn log_level(&self) -> &str {
        self.logging_value(|l| l.level.as_deref()).unwrap_or("info")
    }

    /// Effective log format (project > global > "pretty")
    pub fn log_format(&self) -> &str {
        self.logging_value(|l| l.format.as_deref())
            .unwrap_or("pretty")
    }

    /// Extra filter directives, if any
    pub fn log_filter(&self) -> Option<&str> {
        self.logging_value(|l| l.filter.as_deref())
    }

    /// Merged logging section
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: Some(self.log_level().to_string()),
            format: Some(self.log_format().to_string()),
            filter: self.log_filter().map(str::to_string),
        }
    }

    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if this is a project (has cplug.toml)
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }

    fn logging_value<'a>(
        &'a self,
        pick: impl Fn(&'a LoggingConfig) -> Option<&'a str>,
    ) -> Option<&'a str> {
        self.project
            .logging
            .as_ref()
            .and_then(&pick)
            .or_else(|| self.global.logging.as_ref().and_then(&pick))
    }
}
