//! Zero-copy hardware video buffer pool.
//!
//! Decoded pictures are staged into physically-backed memory blocks that a
//! hardware compositor reads directly. The pool keeps those blocks stable
//! across frames so unchanged content is neither copied again nor
//! re-registered with the hardware.
//!
//! - [`PoolController`]: allocates entries with best-fit reuse, bounds the
//!   free pool with LRU eviction, and caches entries by source picture across
//!   two frame generations.
//! - [`EntryRef`]: counted reference to an entry; the last drop returns it to
//!   the free pool.
//! - [`HeaderPool`] / [`HeaderRef`]: hardware buffer headers carrying entry
//!   references to a [`HardwarePort`].
//! - [`PortPoolRef`]: shared ownership of a port's header pool, with teardown
//!   that is safe to trigger from a completion callback.
//! - [`PictureBufferContext`]: returns a decoder output buffer to its port
//!   when the picture using it is released.
//! - [`ZeroCopyPool`] and [`SubpicStash`]: the display-side picture path and
//!   per-layer overlay state.
//!
//! # Threading
//!
//! Producers call [`PoolController::submit_for_frame`] from a decode thread
//! while driver completion callbacks drop headers on their own threads.
//! List state sits behind one mutex; reference counts are atomics. Nothing
//! blocks on the allocator while holding the lock.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use vzc_pool::mock::{MockAllocator, MockPicture};
//! use vzc_pool::{PictureRef, PoolConfig, Rect, ZeroCopyPool};
//!
//! let pool = ZeroCopyPool::new(&PoolConfig::default(), Arc::new(MockAllocator::new()))?;
//! let picture: PictureRef = MockPicture::solid(64, 64, 0x80);
//!
//! let buf = pool.buffer_from_picture(&picture, true, Rect::new(0, 0, 640, 480), 255)?;
//! assert_eq!(buf.payload().length, 64 * 64);
//!
//! // The same picture in the next frame reuses the staged entry.
//! drop(buf);
//! let again = pool.buffer_from_picture(&picture, true, Rect::new(0, 0, 640, 480), 255)?;
//! assert_eq!(pool.stats().copies, 1);
//! # drop(again);
//! # Ok::<(), vzc_pool::PoolError>(())
//! ```

pub mod alloc;
pub mod config;
pub mod context;
pub mod controller;
pub mod entry;
pub mod entry_list;
pub mod error;
pub mod header;
pub mod picture;
pub mod port;
pub mod port_pool;
pub mod subpic;
pub mod sysmem;
pub mod vzc;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use alloc::{AllocError, CmaBlock, MemoryAllocator};
pub use config::PoolConfig;
pub use context::{PictureBufferContext, MAX_CONTEXT_BUFFERS};
pub use controller::{FrameEntry, PoolController, PoolStats};
pub use entry::{EntryId, EntryRef};
pub use error::{PoolError, PoolResult};
pub use header::{BufferHeader, HeaderPool, HeaderRef, Payload, PreRelease};
pub use picture::{Picture, PictureFormat, PictureRef, PlaneView};
pub use port::{
    default_completion, CompletionCallback, DisplayRegion, HardwarePort, PortStatus, Rect,
    SendError,
};
pub use port_pool::{PortPoolRef, Recycled, ReleaseContext};
pub use subpic::{SubpicStash, SubpicUpdate};
pub use vzc::{send_replicated, ZeroCopyPool};
