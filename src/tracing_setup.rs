//! Subscriber installation for binaries and tests.
//!
//! One `fmt` layer over a registry, filtered by `RUST_LOG` when set and by
//! the configured level otherwise. Thread names are on by default: port
//! teardown runs on named worker threads and the name is the quickest way
//! to tell it apart from the decode loop.
//!
//! # Example
//! ```no_run
//! use vzc::tracing_setup::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! tracing_setup::init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json))?;
//! # Ok::<(), vzc::VzcError>(())
//! ```

use crate::config::LoggingConfig;
use crate::error::{Result, VzcError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::Level;
use tracing_subscriber::{
    fmt::layer, layer::SubscriberExt, registry::Registry, util::SubscriberInitExt, EnvFilter,
    Layer,
};

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored
    Pretty,
    /// One line per event, no color
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        })
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        [Self::Pretty, Self::Compact, Self::Json]
            .into_iter()
            .find(|f| s.eq_ignore_ascii_case(&f.to_string()))
            .ok_or_else(|| format!("unknown log format '{s}' (pretty, compact, json)"))
    }
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Used when `RUST_LOG` is unset
    pub level: Level,
    /// Line rendering.
    pub format: OutputFormat,
    /// Show the emitting thread's name
    pub thread_names: bool,
    /// Show source file and line
    pub source_location: bool,
    /// Colors; ignored for compact and JSON output
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    /// Pretty output at `level` with thread names.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::Pretty,
            thread_names: true,
            source_location: false,
            ansi: true,
        }
    }

    /// Options for the `[logging]` section.
    ///
    /// # Errors
    ///
    /// [`VzcError::InvalidConfig`] for an unknown level.
    pub fn from_logging(logging: &LoggingConfig) -> Result<Self> {
        let level = parse_log_level(&logging.level).map_err(VzcError::InvalidConfig)?;
        Ok(Self::new(level).with_format(logging.format))
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Show source file and line.
    #[must_use]
    pub fn with_source_location(mut self, enabled: bool) -> Self {
        self.source_location = enabled;
        self
    }

    /// Enable colors for pretty output.
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_ascii_lowercase()))
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let base = layer()
            .with_thread_names(self.thread_names)
            .with_file(self.source_location)
            .with_line_number(self.source_location);
        match self.format {
            OutputFormat::Pretty => base.pretty().with_ansi(self.ansi).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
            OutputFormat::Json => base.json().with_ansi(false).boxed(),
        }
    }
}

/// Install a subscriber for the `[logging]` section.
///
/// # Errors
///
/// See [`TracingConfig::from_logging`] and [`init`].
pub fn init_from_config(logging: &LoggingConfig) -> Result<()> {
    init(TracingConfig::from_logging(logging)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` without doing anything when a global subscriber is
/// already set, so tests and tools may call it more than once.
///
/// # Errors
///
/// [`VzcError::Tracing`] if installation fails.
pub fn init(config: TracingConfig) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let filter = config.filter();
    let result = tracing_subscriber::registry()
        .with(config.fmt_layer().with_filter(filter))
        .try_init();

    match result {
        Ok(()) => Ok(()),
        // Lost a race with another initializer.
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(VzcError::Tracing(e.to_string())),
    }
}

/// Case-insensitive level name.
pub(crate) fn parse_log_level(level: &str) -> std::result::Result<Level, String> {
    level
        .parse::<Level>()
        .map_err(|_| format!("unknown log level '{level}' (trace, debug, info, warn, error)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace"), Ok(Level::TRACE));
        assert_eq!(parse_log_level("WARN"), Ok(Level::WARN));
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_from_logging_section() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            format: OutputFormat::Json,
        };
        let config = TracingConfig::from_logging(&logging).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.thread_names);
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("compact".parse::<OutputFormat>(), Ok(OutputFormat::Compact));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_init_twice() {
        let config = TracingConfig::new(Level::WARN).with_ansi(false);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
