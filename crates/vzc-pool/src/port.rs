//! Contract with hardware ports.
//!
//! A port accepts [`HeaderRef`]s with [`HardwarePort::send`] and hands each
//! one back through the completion callback installed by
//! [`HardwarePort::enable`]. Callbacks run on a driver-owned thread and must
//! not block.

use crate::header::HeaderRef;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Status reported by a port for a send or a completed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    /// Accepted or completed normally.
    Ok,
    /// Driver ran out of memory.
    NoMemory,
    /// Port queue is full.
    NoSpace,
    /// Buffer or parameter rejected.
    Invalid,
    /// Try again later.
    Again,
    /// Port is not enabled.
    NotEnabled,
    /// Any other driver status code.
    Driver(i32),
}

impl PortStatus {
    /// True for [`PortStatus::Ok`].
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("success"),
            Self::NoMemory => f.write_str("out of memory"),
            Self::NoSpace => f.write_str("out of resources"),
            Self::Invalid => f.write_str("invalid argument"),
            Self::Again => f.write_str("resource temporarily unavailable"),
            Self::NotEnabled => f.write_str("port not enabled"),
            Self::Driver(code) => write!(f, "driver status {code}"),
        }
    }
}

/// A send the port refused. The buffer comes back to the caller.
#[derive(Debug)]
pub struct SendError {
    /// The buffer the port refused.
    pub buffer: HeaderRef,
    /// Why it was refused.
    pub status: PortStatus,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send of buffer {} failed: {}", self.buffer.index(), self.status)
    }
}

impl std::error::Error for SendError {}

/// Called by the driver for every buffer it is done with.
pub type CompletionCallback = Arc<dyn Fn(HeaderRef, PortStatus) + Send + Sync>;

/// Rectangle in display coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Rectangle at `(x, y)` of the given size.
    #[must_use]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Placement of a port's output on the display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayRegion {
    /// Where the layer is shown.
    pub dest_rect: Rect,
    /// Layer opacity, 255 is opaque.
    pub alpha: u8,
    /// Compositing layer, higher is on top.
    pub layer: i32,
}

/// A hardware port buffers are exchanged with.
pub trait HardwarePort: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Queue a buffer. On failure the buffer is handed back.
    ///
    /// # Errors
    ///
    /// [`SendError`] carrying the buffer and the driver status.
    fn send(&self, buffer: HeaderRef) -> Result<(), SendError>;

    /// Enable the port with the callback that receives completed buffers.
    ///
    /// # Errors
    ///
    /// The driver status if the port cannot be enabled.
    fn enable(&self, callback: CompletionCallback) -> Result<(), PortStatus>;

    /// Disable the port. In-flight buffers come back through the callback
    /// before this returns.
    fn disable(&self);

    /// True between `enable` and `disable`.
    fn is_enabled(&self) -> bool;

    /// Update where the port's output is shown.
    ///
    /// # Errors
    ///
    /// The driver status if the region is rejected.
    fn set_display_region(&self, region: &DisplayRegion) -> Result<(), PortStatus>;
}

/// Completion callback that logs failures and releases the buffer.
#[must_use]
pub fn default_completion(port_name: &str) -> CompletionCallback {
    let name = port_name.to_owned();
    Arc::new(move |buffer: HeaderRef, status: PortStatus| {
        if !status.is_ok() {
            warn!(port = %name, index = buffer.index(), %status, "Buffer completed with error");
        }
        drop(buffer);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderPool;

    #[test]
    fn test_status_display() {
        assert_eq!(PortStatus::NoSpace.to_string(), "out of resources");
        assert_eq!(PortStatus::Driver(-5).to_string(), "driver status -5");
        assert!(PortStatus::Ok.is_ok());
        assert!(!PortStatus::Again.is_ok());
    }

    #[test]
    fn test_send_error_keeps_buffer() {
        let pool = HeaderPool::new(1);
        let err = SendError {
            buffer: pool.get().unwrap(),
            status: PortStatus::Invalid,
        };
        assert!(err.to_string().contains("invalid argument"));
        assert_eq!(pool.available(), 0);
        drop(err);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_default_completion_releases() {
        let pool = HeaderPool::new(1);
        let cb = default_completion("test");
        cb(pool.get().unwrap(), PortStatus::Invalid);
        assert_eq!(pool.available(), 1);
    }
}
