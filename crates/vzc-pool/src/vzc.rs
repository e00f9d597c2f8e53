//! Zero-copy picture path: decoded pictures in, ready-to-send headers out.

use crate::alloc::MemoryAllocator;
use crate::config::PoolConfig;
use crate::controller::{PoolController, PoolStats};
use crate::error::{PoolError, PoolResult};
use crate::header::{HeaderPool, HeaderRef, Payload};
use crate::picture::PictureRef;
use crate::port::{HardwarePort, Rect};
use std::sync::Arc;
use tracing::{trace, warn};

/// A pool controller paired with the headers that carry its entries.
#[derive(Clone, Debug)]
pub struct ZeroCopyPool {
    controller: PoolController,
    headers: HeaderPool,
}

impl ZeroCopyPool {
    /// Build a controller and a header pool from `config`.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: &PoolConfig, allocator: Arc<dyn MemoryAllocator>) -> PoolResult<Self> {
        let controller = PoolController::new(config, allocator)?;
        Ok(Self {
            controller,
            headers: HeaderPool::new(config.header_count),
        })
    }

    /// Stage `picture` for the frame being built and describe it in a header.
    ///
    /// The header's payload holds one entry reference, the staged length,
    /// the entry's sequence number, the picture dimensions and pts, and the
    /// display placement. Dropping the header gives the entry reference back.
    ///
    /// # Errors
    ///
    /// - [`PoolError::HeadersExhausted`] if every header is in use.
    /// - [`PoolError::OutOfMemory`] if the picture needed a new block and
    ///   allocation failed.
    pub fn buffer_from_picture(
        &self,
        picture: &PictureRef,
        is_first: bool,
        dest_rect: Rect,
        alpha: u8,
    ) -> PoolResult<HeaderRef> {
        let Some(buf) = self.headers.get() else {
            warn!(size = self.headers.size(), "No free header for picture");
            return Err(PoolError::HeadersExhausted);
        };

        let frame = self.controller.submit_for_frame(picture, is_first)?;
        {
            let mut payload = buf.payload();
            payload.seq = frame.entry.seq();
            payload.length = frame.len;
            payload.offset = 0;
            payload.width = frame.width;
            payload.height = frame.height;
            payload.pts = picture.pts();
            payload.flags = Payload::FLAG_FRAME_END;
            payload.dest_rect = dest_rect;
            payload.alpha = alpha;
            payload.entry = Some(frame.entry);
        }
        trace!(index = buf.index(), copied = frame.copied, "Picture buffer ready");
        Ok(buf)
    }

    /// Underlying entry controller.
    #[must_use]
    pub fn controller(&self) -> &PoolController {
        &self.controller
    }

    /// Headers handed out by [`buffer_from_picture`](Self::buffer_from_picture).
    #[must_use]
    pub fn headers(&self) -> &HeaderPool {
        &self.headers
    }

    /// Controller statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.controller.stats()
    }

    /// Drop cached entries and destroy the header pool. Headers still out
    /// are dropped when released.
    pub fn shutdown(&self) {
        self.controller.shutdown();
        self.headers.destroy();
    }
}

/// Send a copy of `src` to `port` using a header from `pool`.
///
/// The copy takes its own entry reference, so `src` stays usable. `pts`
/// overrides the copied timestamp.
///
/// # Errors
///
/// - [`PoolError::HeadersExhausted`] if `pool` is empty.
/// - [`PoolError::PortRejected`] if the port refuses; the copy is released.
pub fn send_replicated(
    port: &dyn HardwarePort,
    pool: &HeaderPool,
    src: &HeaderRef,
    pts: Option<i64>,
) -> PoolResult<()> {
    let dst = pool.get().ok_or(PoolError::HeadersExhausted)?;
    let mut payload = src.payload().clone();
    payload.pts = pts;
    *dst.payload() = payload;

    port.send(dst).map_err(|err| {
        warn!(port = port.name(), status = %err.status, "Replicated send refused");
        PoolError::PortRejected(err.status)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAllocator, MockPicture, MockPort};
    use crate::port::{default_completion, PortStatus};

    fn zc(headers: usize) -> (ZeroCopyPool, Arc<MockAllocator>) {
        let allocator = Arc::new(MockAllocator::new());
        let config = PoolConfig::default()
            .with_max_free_entries(4)
            .with_header_count(headers);
        (ZeroCopyPool::new(&config, allocator.clone()).unwrap(), allocator)
    }

    fn full_frame(pool: &ZeroCopyPool, pic: &PictureRef, is_first: bool) -> PoolResult<HeaderRef> {
        pool.buffer_from_picture(pic, is_first, Rect::default(), 255)
    }

    #[test]
    fn test_buffer_from_picture_fills_payload() {
        let (pool, _allocator) = zc(4);
        let pic: PictureRef = MockPicture::solid_at(32, 16, 0x40, 1234);
        let rect = Rect::new(10, 20, 320, 160);

        let buf = pool.buffer_from_picture(&pic, true, rect, 200).unwrap();
        let payload = buf.payload();
        let entry = payload.entry.as_ref().unwrap();
        assert_eq!(payload.seq, entry.seq());
        assert_eq!(payload.length, 32 * 16);
        assert_eq!((payload.width, payload.height), (32, 16));
        assert_eq!(payload.pts, Some(1234));
        assert_eq!(payload.dest_rect, rect);
        assert_eq!(payload.alpha, 200);
        assert_eq!(entry.bytes()[0], 0x40);
    }

    #[test]
    fn test_releasing_header_returns_entry() {
        let (pool, _allocator) = zc(4);
        let pic: PictureRef = MockPicture::solid(8, 8, 1);

        let buf = full_frame(&pool, &pic, true).unwrap();
        drop(buf);
        assert_eq!(pool.headers().available(), 4);

        // Still cached in the current generation for the next frame.
        let again = full_frame(&pool, &pic, true).unwrap();
        assert_eq!(pool.stats().copies, 1);
        drop(again);
    }

    #[test]
    fn test_headers_exhausted() {
        let (pool, _allocator) = zc(1);
        let a: PictureRef = MockPicture::solid(8, 8, 1);
        let b: PictureRef = MockPicture::solid(8, 8, 2);

        let held = full_frame(&pool, &a, true).unwrap();
        let err = full_frame(&pool, &b, false).unwrap_err();
        assert!(matches!(err, PoolError::HeadersExhausted));
        assert_eq!(pool.stats().copies, 1);
        drop(held);
    }

    #[test]
    fn test_out_of_memory_returns_header() {
        let (pool, allocator) = zc(2);
        let pic: PictureRef = MockPicture::solid(8, 8, 1);
        allocator.fail_next_allocations(1);

        let err = full_frame(&pool, &pic, true).unwrap_err();
        assert!(matches!(err, PoolError::OutOfMemory { .. }));
        assert_eq!(pool.headers().available(), 2);
    }

    #[test]
    fn test_send_replicated_shares_entry() {
        let (pool, _allocator) = zc(2);
        let port = MockPort::new("display");
        port.enable(default_completion("display")).unwrap();
        let out = HeaderPool::new(2);
        let pic: PictureRef = MockPicture::solid(8, 8, 1);

        let src = full_frame(&pool, &pic, true).unwrap();
        send_replicated(&port, &out, &src, Some(99)).unwrap();

        let sent = port.take_in_flight().unwrap();
        assert_eq!(sent.payload().pts, Some(99));
        assert_eq!(sent.payload().seq, src.payload().seq);
        let entry_refs = src.payload().entry.as_ref().unwrap().ref_count();
        // affinity + source header + replicated header
        assert_eq!(entry_refs, 3);
    }

    #[test]
    fn test_send_replicated_rejected() {
        let (pool, _allocator) = zc(2);
        let port = MockPort::new("display");
        let out = HeaderPool::new(1);
        let pic: PictureRef = MockPicture::solid(8, 8, 1);
        let src = full_frame(&pool, &pic, true).unwrap();

        // Port never enabled.
        let err = send_replicated(&port, &out, &src, None).unwrap_err();
        assert!(matches!(err, PoolError::PortRejected(PortStatus::NotEnabled)));
        assert_eq!(out.available(), 1);
    }

    #[test]
    fn test_shutdown_destroys_headers() {
        let (pool, allocator) = zc(2);
        let pic: PictureRef = MockPicture::solid(8, 8, 1);
        drop(full_frame(&pool, &pic, true).unwrap());

        pool.shutdown();
        assert!(pool.headers().is_destroyed());
        assert_eq!(allocator.live_blocks(), 0);
    }
}
