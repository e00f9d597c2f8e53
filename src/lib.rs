//! Process-level setup for the zero-copy video buffer pool.
//!
//! The pool itself lives in [`vzc_pool`] and is re-exported here as
//! [`pool`]. This crate adds what an application around it needs:
//!
//! - [`config`]: figment-based loading of [`VzcConfig`] from TOML and
//!   `VZC_`-prefixed environment variables
//! - [`tracing_setup`]: subscriber installation with pretty, compact or JSON
//!   output
//! - [`error`]: the [`VzcError`] type tying both together
//!
//! The `vzc-soak` binary drives the whole picture path against mock
//! hardware.

pub mod config;
pub mod error;
pub mod tracing_setup;

pub use config::{LoggingConfig, VzcConfig};
pub use error::{Result, VzcError};
pub use vzc_pool as pool;
