//! Per-picture context tying hardware buffers to their port pool.
//!
//! A decoder that hands a hardware output buffer to the rest of the pipeline
//! wraps it in a [`PictureBufferContext`]. The context keeps the buffer and
//! the port pool alive. When the buffer's last reference goes, its
//! pre-release hook sends it straight back to the port for refilling and
//! drops the context's hold on the port pool.

use crate::header::{HeaderRef, PreRelease};
use crate::port_pool::{PortPoolRef, ReleaseContext};
use smallvec::SmallVec;
use tracing::trace;

/// Most buffers one context holds.
pub const MAX_CONTEXT_BUFFERS: usize = 4;

/// Hardware buffers attached to one picture.
#[derive(Debug)]
pub struct PictureBufferContext {
    buffers: SmallVec<[HeaderRef; MAX_CONTEXT_BUFFERS]>,
}

impl PictureBufferContext {
    /// Wrap `buffer`, taking a reference on `ppr` that lasts until the
    /// buffer's final release.
    ///
    /// The installed hook runs once on the last release of `buffer`: it
    /// re-acquires the header so the release completes as a full cycle,
    /// recycles it to the port, then releases the port pool reference in
    /// callback context.
    #[must_use]
    pub fn new(buffer: HeaderRef, ppr: &PortPoolRef) -> Self {
        let hook_ref = ppr.acquire();
        buffer.set_pre_release(Box::new(move |header| {
            let buf = HeaderRef::reacquire(header);
            let outcome = hook_ref.recycle_buffer(buf);
            trace!(index = header.index(), ?outcome, "Picture buffer returned to port");
            hook_ref.release(ReleaseContext::Callback);
            PreRelease::Handled
        }));

        let mut buffers = SmallVec::new();
        buffers.push(buffer);
        Self { buffers }
    }

    /// Attach another buffer. Hands it back if the context is full.
    ///
    /// # Errors
    ///
    /// Returns `buffer` unchanged when [`MAX_CONTEXT_BUFFERS`] are held.
    pub fn push(&mut self, buffer: HeaderRef) -> Result<(), HeaderRef> {
        if self.buffers.len() >= MAX_CONTEXT_BUFFERS {
            return Err(buffer);
        }
        self.buffers.push(buffer);
        Ok(())
    }

    /// New context holding one more reference to each buffer.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            buffers: self.buffers.iter().cloned().collect(),
        }
    }

    /// Release every held buffer once.
    pub fn destroy(self) {
        trace!(buffers = self.buffers.len(), "Destroying picture context");
        drop(self);
    }

    /// Every held buffer, primary first.
    #[must_use]
    pub fn buffers(&self) -> &[HeaderRef] {
        &self.buffers
    }

    /// Buffer the context was created with.
    #[must_use]
    pub fn primary(&self) -> Option<&HeaderRef> {
        self.buffers.first()
    }

    /// Number of held buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// True if no buffer is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderPool;
    use crate::mock::MockPort;
    use crate::port::{default_completion, HardwarePort, PortStatus};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn setup(headers: usize) -> (Arc<MockPort>, PortPoolRef) {
        let port = Arc::new(MockPort::new("decoder-out"));
        port.enable(default_completion("decoder-out")).unwrap();
        let ppr = PortPoolRef::create(port.clone(), headers).unwrap();
        (port, ppr)
    }

    #[test]
    fn test_new_holds_port_pool() {
        let (_port, ppr) = setup(2);
        let buf = ppr.pool().get().unwrap();

        let ctx = PictureBufferContext::new(buf, &ppr);
        assert_eq!(ppr.ref_count(), 2);
        assert_eq!(ctx.len(), 1);
        assert!(ctx.primary().unwrap().has_pre_release());
    }

    #[test]
    fn test_copy_shares_buffers() {
        let (port, ppr) = setup(2);
        let ctx = PictureBufferContext::new(ppr.pool().get().unwrap(), &ppr);

        let copy = ctx.copy();
        assert_eq!(ctx.primary().unwrap().ref_count(), 2);
        assert!(copy.primary().unwrap().same_header(ctx.primary().unwrap()));

        ctx.destroy();
        assert_eq!(copy.primary().unwrap().ref_count(), 1);
        assert_eq!(port.in_flight_len(), 0);
        assert_eq!(ppr.ref_count(), 2);

        copy.destroy();
        assert_eq!(port.in_flight_len(), 1);
        assert_eq!(ppr.ref_count(), 1);
    }

    #[test]
    fn test_last_release_recycles_to_port_once() {
        let (port, ppr) = setup(1);
        let ctx = PictureBufferContext::new(ppr.pool().get().unwrap(), &ppr);
        ctx.destroy();

        assert_eq!(port.sent_count(), 1);
        let buf = port.take_in_flight().unwrap();
        assert!(!buf.has_pre_release());

        // Hook is gone: the next release goes straight to the pool.
        drop(buf);
        assert_eq!(port.sent_count(), 1);
        assert_eq!(ppr.pool().available(), 1);
    }

    #[test]
    fn test_rejected_recycle_releases_to_pool() {
        let (port, ppr) = setup(1);
        let ctx = PictureBufferContext::new(ppr.pool().get().unwrap(), &ppr);

        port.reject_all(PortStatus::NoSpace);
        ctx.destroy();

        assert_eq!(port.in_flight_len(), 0);
        assert_eq!(ppr.pool().available(), 1);
        assert_eq!(ppr.ref_count(), 1);
    }

    #[test]
    fn test_context_outliving_owner_tears_down_off_thread() {
        let (port, ppr) = setup(2);
        let pool = ppr.pool().clone();
        let ctx = PictureBufferContext::new(ppr.pool().get().unwrap(), &ppr);

        ppr.release(ReleaseContext::Caller);
        assert!(!pool.is_destroyed());

        ctx.destroy();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pool.is_destroyed() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(pool.is_destroyed());
        assert_ne!(port.disable_thread(), Some(std::thread::current().id()));
    }

    #[test]
    fn test_push_is_bounded() {
        let (_port, ppr) = setup(1);
        let extra = HeaderPool::new(MAX_CONTEXT_BUFFERS);
        let mut ctx = PictureBufferContext::new(ppr.pool().get().unwrap(), &ppr);

        for _ in 1..MAX_CONTEXT_BUFFERS {
            ctx.push(extra.get().unwrap()).unwrap();
        }
        let rejected = ctx.push(extra.get().unwrap()).unwrap_err();
        drop(rejected);

        assert_eq!(ctx.len(), MAX_CONTEXT_BUFFERS);
        ctx.destroy();
        assert_eq!(extra.available(), MAX_CONTEXT_BUFFERS);
    }
}
