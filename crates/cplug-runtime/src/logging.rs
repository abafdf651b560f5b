//! Logging setup
//!
//! The runtime emits `tracing` events (library open/close and symbol binding
//! at debug, CIF preparation and invocations at trace, callback failures at
//! warn/error). Hosts that do not install their own subscriber can use
//! `init_logging` to get a formatted subscriber on stderr.

use cplug_config::LoggingConfig;
use std::str::FromStr;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Logging setup errors
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid filter directive '{0}'")]
    InvalidDirective(String),

    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-line
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level
    pub level: Level,
    pub format: LogFormat,
    /// Emit span open/close events
    pub span_events: bool,
    /// Extra filter directives (e.g. "cplug_runtime=trace")
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[logging]` section of a configuration file
    ///
    /// Missing or unparsable values keep their defaults.
    pub fn from_settings(settings: &LoggingConfig) -> Self {
        let defaults = Self::default();
        Self {
            level: settings
                .level
                .as_deref()
                .and_then(|l| Level::from_str(l).ok())
                .unwrap_or(defaults.level),
            format: settings
                .format
                .as_deref()
                .and_then(|f| f.parse().ok())
                .unwrap_or(defaults.format),
            span_events: false,
            filter: settings.filter.clone(),
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Install a global subscriber writing to stderr
///
/// `RUST_LOG` is honoured; the configured level and filter directives are
/// added on top. Fails instead of panicking when a subscriber is already
/// installed.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    let filter = build_filter(&config)?;
    let spans = span_events_config(config.span_events);

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .pretty()
            .with_span_events(spans)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_span_events(spans)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_span_events(spans)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}

fn build_filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    let base = EnvFilter::from_default_env()
        .add_directive(LevelFilter::from_level(config.level).into());

    match &config.filter {
        Some(directives) => directives
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .try_fold(base, |filter, directive| {
                let parsed = directive
                    .parse()
                    .map_err(|_| LoggingError::InvalidDirective(directive.to_string()))?;
                Ok(filter.add_directive(parsed))
            }),
        None => Ok(base),
    }
}

fn span_events_config(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}
