//! Error types for the zero-copy buffer pool.
//!
//! Three kinds of failure matter to callers:
//!
//! - **`OutOfMemory`**: the external allocator could not provide or map a
//!   block while growing the pool. The caller treats the picture as
//!   undeliverable for this frame; no entry is left referenced.
//! - **`PortRejected`**: the hardware port refused a buffer. Recycling paths
//!   recover from this locally by returning the buffer to its header pool, so
//!   this variant only surfaces from explicit submission calls
//!   ([`PortPoolRef::fill`](crate::PortPoolRef::fill), the display paths).
//! - **`ProtocolViolation`**: a reference-counting contract was broken
//!   upstream. These are also logged at `error` level where they are detected.

use crate::alloc::AllocError;
use crate::port::PortStatus;
use thiserror::Error;

/// Convenience alias for results returned by the pool.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Primary error type for the buffer pool.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The memory allocator failed to allocate or map a block.
    #[error("out of memory allocating {requested} bytes: {source}")]
    OutOfMemory {
        /// Bytes requested from the allocator (after granularity rounding).
        requested: usize,
        /// Underlying allocator failure.
        #[source]
        source: AllocError,
    },

    /// The hardware port refused a buffer.
    #[error("port rejected buffer: {0}")]
    PortRejected(PortStatus),

    /// No free buffer header was available to carry a picture.
    #[error("no free buffer headers")]
    HeadersExhausted,

    /// A reference-counting or lifecycle contract was broken.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Configuration values failed validation.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Whether the failure is expected to clear up on a later attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PortRejected(_) | Self::HeadersExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_message() {
        let err = PoolError::OutOfMemory {
            requested: 65536,
            source: AllocError::Allocate(65536),
        };
        let msg = err.to_string();
        assert!(msg.contains("65536"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_kinds() {
        assert!(PoolError::PortRejected(PortStatus::NoSpace).is_transient());
        assert!(PoolError::HeadersExhausted.is_transient());
        assert!(!PoolError::ProtocolViolation("x".into()).is_transient());
    }
}
