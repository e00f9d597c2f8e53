//! Errors for configuration loading and process setup.

use thiserror::Error;
use vzc_pool::PoolError;

/// Convenience alias for results in the `vzc` crate.
pub type Result<T> = std::result::Result<T, VzcError>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum VzcError {
    /// Reading or merging configuration sources failed.
    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but holds invalid values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error from the buffer pool.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The tracing subscriber could not be installed.
    #[error("failed to initialize tracing: {0}")]
    Tracing(String),
}

impl From<figment::Error> for VzcError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_is_transparent() {
        let err: VzcError = PoolError::HeadersExhausted.into();
        assert_eq!(err.to_string(), "no free buffer headers");
    }

    #[test]
    fn test_invalid_config_message() {
        let err = VzcError::InvalidConfig("bad level".into());
        assert!(err.to_string().contains("bad level"));
    }
}
