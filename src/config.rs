//! Configuration loading.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. a TOML file (`config/vzc.toml` by default)
//! 3. environment variables prefixed with `VZC_`, nested keys separated by
//!    `__` (`VZC_POOL__GRANULARITY=131072`, `VZC_LOGGING__LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use vzc::config::VzcConfig;
//!
//! let config = VzcConfig::load()?;
//! println!("granularity: {}", config.pool.granularity);
//! # Ok::<(), vzc::VzcError>(())
//! ```

use crate::error::{Result, VzcError};
use crate::tracing_setup::{parse_log_level, OutputFormat};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use vzc_pool::PoolConfig;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/vzc.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VzcConfig {
    /// Buffer pool settings
    pub pool: PoolConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

impl VzcConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// # Errors
    ///
    /// Fails if a source cannot be parsed or the result is invalid.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file is
    /// not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Fails if a source cannot be parsed or the result is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VZC_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    ///
    /// # Errors
    ///
    /// [`VzcError::InvalidConfig`] for a bad log level, or the pool's own
    /// validation error.
    pub fn validate(&self) -> Result<()> {
        parse_log_level(&self.logging.level).map_err(VzcError::InvalidConfig)?;
        self.pool.validate()?;
        Ok(())
    }
}
