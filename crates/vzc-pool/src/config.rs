//! Pool configuration.
//!
//! `PoolConfig` deserializes with defaults for every field, so an empty
//! table is a valid configuration. Call [`PoolConfig::validate`] before use;
//! [`PoolController::new`](crate::PoolController::new) does so itself.

use crate::error::{PoolError, PoolResult};
use crate::sysmem;
use serde::{Deserialize, Serialize};

/// Systems with less memory than this get the smaller free-pool bound.
const LOW_MEMORY_THRESHOLD: u64 = 1 << 30;
const FREE_ENTRIES_LOW_MEMORY: usize = 4;
const FREE_ENTRIES_DEFAULT: usize = 8;

/// Tunables of a pool controller and its header pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Bound on the free pool. `None` derives it from system memory.
    pub max_free_entries: Option<usize>,
    /// Allocation granularity in bytes (power of two).
    pub granularity: usize,
    /// Entries one frame may stage before generations rotate on their own.
    pub max_per_frame: usize,
    /// Buffer headers per header pool.
    pub header_count: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_free_entries: None,
            granularity: 65536,
            max_per_frame: 4,
            header_count: 30,
        }
    }
}

impl PoolConfig {
    /// Set an explicit free-pool bound.
    #[must_use]
    pub fn with_max_free_entries(mut self, n: usize) -> Self {
        self.max_free_entries = Some(n);
        self
    }

    /// Set the allocation granularity.
    #[must_use]
    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    /// Set the entries one frame may stage before a forced rotation.
    #[must_use]
    pub fn with_max_per_frame(mut self, n: usize) -> Self {
        self.max_per_frame = n;
        self
    }

    /// Set the headers per header pool.
    #[must_use]
    pub fn with_header_count(mut self, n: usize) -> Self {
        self.header_count = n;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_free_entries == Some(0) {
            return Err(PoolError::InvalidConfig(
                "max_free_entries must be greater than 0".into(),
            ));
        }
        if !self.granularity.is_power_of_two() {
            return Err(PoolError::InvalidConfig(format!(
                "granularity must be a power of two, got {}",
                self.granularity
            )));
        }
        if self.max_per_frame == 0 {
            return Err(PoolError::InvalidConfig(
                "max_per_frame must be greater than 0".into(),
            ));
        }
        if self.header_count == 0 {
            return Err(PoolError::InvalidConfig(
                "header_count must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Free-pool bound after resolving `None` against system memory.
    #[must_use]
    pub fn resolved_max_free_entries(&self) -> usize {
        self.max_free_entries
            .unwrap_or_else(|| free_entries_for(sysmem::total_memory()))
    }
}

fn free_entries_for(total_memory: Option<u64>) -> usize {
    match total_memory {
        Some(total) if total < LOW_MEMORY_THRESHOLD => FREE_ENTRIES_LOW_MEMORY,
        _ => FREE_ENTRIES_DEFAULT,
    }
}
