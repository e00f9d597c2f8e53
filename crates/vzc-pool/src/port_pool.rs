//! Reference-counted ownership of a port and its header pool.
//!
//! Several parties keep a port's header pool alive: the decoder that owns
//! the port, and every picture context whose headers still need to go back
//! to it. [`PortPoolRef`] counts them. When the count reaches zero the port
//! is disabled and the pool destroyed.
//!
//! Destroying the pool may have to wait for the driver, and the last release
//! often happens inside a completion callback where waiting would deadlock.
//! Releases made with [`ReleaseContext::Callback`] therefore run the teardown
//! on a blocking worker instead of the calling thread.

use crate::error::{PoolError, PoolResult};
use crate::header::{HeaderPool, HeaderRef};
use crate::port::HardwarePort;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Where a release is made from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseContext {
    /// Ordinary thread; teardown may run inline.
    Caller,
    /// Driver completion callback; teardown must not run inline.
    Callback,
}

/// What [`PortPoolRef::recycle_buffer`] did with a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recycled {
    /// Sent back to the port to be refilled.
    Sent,
    /// The port refused it; released to the header pool instead.
    Released,
}

struct PortPoolShared {
    refs: AtomicUsize,
    port: Arc<dyn HardwarePort>,
    pool: HeaderPool,
    destroyed: AtomicBool,
}

impl PortPoolShared {
    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            error!(port = self.port.name(), "Port pool destroyed twice - protocol violation");
            return;
        }
        let refs = self.refs.load(Ordering::Acquire);
        if refs != 0 {
            error!(
                port = self.port.name(),
                refs,
                "Port pool destroyed while referenced - protocol violation"
            );
        }

        if self.port.is_enabled() {
            self.port.disable();
        }
        self.pool.destroy();
        info!(port = self.port.name(), "Port pool destroyed");
    }
}

/// Counted reference to a port and its header pool.
pub struct PortPoolRef {
    shared: Option<Arc<PortPoolShared>>,
}

impl PortPoolRef {
    /// Create a header pool of `header_count` headers for `port`, with one
    /// reference held by the caller.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidConfig`] if `header_count` is zero.
    pub fn create(port: Arc<dyn HardwarePort>, header_count: usize) -> PoolResult<Self> {
        if header_count == 0 {
            return Err(PoolError::InvalidConfig(
                "port pool needs at least one header".into(),
            ));
        }
        debug!(port = port.name(), header_count, "Port pool created");
        Ok(Self {
            shared: Some(Arc::new(PortPoolShared {
                refs: AtomicUsize::new(1),
                port,
                pool: HeaderPool::new(header_count),
                destroyed: AtomicBool::new(false),
            })),
        })
    }

    fn shared(&self) -> &Arc<PortPoolShared> {
        self.shared.as_ref().expect("port pool reference already released")
    }

    /// Take another reference.
    #[must_use]
    pub fn acquire(&self) -> Self {
        let shared = self.shared();
        let prev = shared.refs.fetch_add(1, Ordering::AcqRel);
        trace!(port = shared.port.name(), refs = prev + 1, "Port pool acquired");
        Self {
            shared: Some(Arc::clone(shared)),
        }
    }

    /// Give up this reference. The last one tears down the pool, inline for
    /// [`ReleaseContext::Caller`] and on a worker for
    /// [`ReleaseContext::Callback`].
    pub fn release(mut self, ctx: ReleaseContext) {
        if let Some(shared) = self.shared.take() {
            release_shared(shared, ctx);
        }
    }

    /// Send every free header to the port for filling.
    ///
    /// Returns the number of headers sent.
    ///
    /// # Errors
    ///
    /// [`PoolError::PortRejected`] if the port refuses a header. That header
    /// goes back to the front of the pool; the ones sent before it stay sent.
    pub fn fill(&self) -> PoolResult<usize> {
        let shared = self.shared();
        let mut sent = 0;
        while let Some(buf) = shared.pool.get() {
            if let Err(err) = shared.port.send(buf) {
                warn!(
                    port = shared.port.name(),
                    sent,
                    status = %err.status,
                    "Port rejected buffer during fill"
                );
                shared.pool.put_back(err.buffer);
                return Err(PoolError::PortRejected(err.status));
            }
            sent += 1;
        }
        trace!(port = shared.port.name(), sent, "Port pool filled");
        Ok(sent)
    }

    /// Reset `buf` and send it back to the port to be refilled.
    ///
    /// If the port refuses, `buf` is released into the header pool.
    pub fn recycle_buffer(&self, buf: HeaderRef) -> Recycled {
        let shared = self.shared();
        let old = std::mem::take(&mut *buf.payload());
        drop(old);

        match shared.port.send(buf) {
            Ok(()) => Recycled::Sent,
            Err(err) => {
                warn!(
                    port = shared.port.name(),
                    index = err.buffer.index(),
                    status = %err.status,
                    "Recycle send refused, releasing buffer"
                );
                drop(err.buffer);
                Recycled::Released
            }
        }
    }

    /// Header pool owned by this reference.
    #[must_use]
    pub fn pool(&self) -> &HeaderPool {
        &self.shared().pool
    }

    /// Port the headers are sent to.
    #[must_use]
    pub fn port(&self) -> &Arc<dyn HardwarePort> {
        &self.shared().port
    }

    /// Current reference count (racy; for diagnostics).
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.shared().refs.load(Ordering::Acquire)
    }
}

impl Clone for PortPoolRef {
    fn clone(&self) -> Self {
        self.acquire()
    }
}

impl Drop for PortPoolRef {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            release_shared(shared, ReleaseContext::Caller);
        }
    }
}

impl std::fmt::Debug for PortPoolRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.shared {
            Some(shared) => f
                .debug_struct("PortPoolRef")
                .field("port", &shared.port.name())
                .field("refs", &shared.refs.load(Ordering::Relaxed))
                .finish(),
            None => f.write_str("PortPoolRef(released)"),
        }
    }
}

fn release_shared(shared: Arc<PortPoolShared>, ctx: ReleaseContext) {
    let prev = shared.refs.fetch_sub(1, Ordering::AcqRel);
    if prev == 0 {
        shared.refs.fetch_add(1, Ordering::AcqRel);
        error!(
            port = shared.port.name(),
            "Port pool released with zero references - protocol violation"
        );
        debug_assert!(false, "port pool reference count underflow");
        return;
    }
    trace!(port = shared.port.name(), refs = prev - 1, ?ctx, "Port pool released");
    if prev != 1 {
        return;
    }

    match ctx {
        ReleaseContext::Caller => shared.destroy(),
        ReleaseContext::Callback => destroy_detached(shared),
    }
}

/// Run the teardown off the calling thread.
fn destroy_detached(shared: Arc<PortPoolShared>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn_blocking(move || shared.destroy());
        return;
    }

    let fallback = Arc::clone(&shared);
    let spawned = std::thread::Builder::new()
        .name("vzc-port-teardown".into())
        .spawn(move || shared.destroy());
    if let Err(e) = spawned {
        error!(error = %e, "Cannot spawn teardown thread, destroying inline");
        fallback.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPort;
    use crate::port::{default_completion, PortStatus};
    use std::time::{Duration, Instant};
    use tracing_test::traced_test;

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn enabled_port() -> Arc<MockPort> {
        let port = Arc::new(MockPort::new("test"));
        port.enable(default_completion("test")).unwrap();
        port
    }

    #[test]
    fn test_create_rejects_zero_headers() {
        let port = Arc::new(MockPort::new("test"));
        assert!(matches!(
            PortPoolRef::create(port, 0),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_acquire_release_counts() {
        let port = enabled_port();
        let ppr = PortPoolRef::create(port.clone(), 4).unwrap();
        let second = ppr.acquire();
        assert_eq!(ppr.ref_count(), 2);

        second.release(ReleaseContext::Caller);
        assert_eq!(ppr.ref_count(), 1);
        assert!(port.is_enabled());
        assert!(!ppr.pool().is_destroyed());
    }

    #[test]
    fn test_last_caller_release_destroys_inline() {
        let port = enabled_port();
        let ppr = PortPoolRef::create(port.clone(), 4).unwrap();
        let pool = ppr.pool().clone();

        ppr.release(ReleaseContext::Caller);
        assert!(pool.is_destroyed());
        assert!(!port.is_enabled());
        assert_eq!(port.disable_thread(), Some(std::thread::current().id()));
    }

    #[test]
    fn test_drop_is_caller_release() {
        let port = enabled_port();
        let ppr = PortPoolRef::create(port.clone(), 2).unwrap();
        let pool = ppr.pool().clone();
        drop(ppr);
        assert!(pool.is_destroyed());
    }

    #[test]
    fn test_callback_release_destroys_on_another_thread() {
        let port = enabled_port();
        let ppr = PortPoolRef::create(port.clone(), 4).unwrap();
        let pool = ppr.pool().clone();

        ppr.release(ReleaseContext::Callback);

        assert!(wait_for(|| pool.is_destroyed()));
        assert!(wait_for(|| port.disable_thread().is_some()));
        assert_ne!(port.disable_thread(), Some(std::thread::current().id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_callback_release_uses_runtime_blocking_pool() {
        let port = enabled_port();
        let ppr = PortPoolRef::create(port.clone(), 4).unwrap();
        let pool = ppr.pool().clone();

        ppr.release(ReleaseContext::Callback);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !pool.is_destroyed() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(pool.is_destroyed());
        assert_eq!(port.disable_count(), 1);
    }

    #[test]
    fn test_fill_sends_every_header() {
        let port = enabled_port();
        let ppr = PortPoolRef::create(port.clone(), 3).unwrap();

        assert_eq!(ppr.fill().unwrap(), 3);
        assert_eq!(port.in_flight_len(), 3);
        assert_eq!(ppr.pool().available(), 0);

        port.complete_all(PortStatus::Ok);
        assert_eq!(ppr.pool().available(), 3);
    }

    #[test]
    fn test_fill_puts_back_rejected_header() {
        let port = enabled_port();
        let ppr = PortPoolRef::create(port.clone(), 3).unwrap();
        port.reject_after(1, PortStatus::NoSpace);

        let err = ppr.fill().unwrap_err();
        assert!(matches!(err, PoolError::PortRejected(PortStatus::NoSpace)));
        assert_eq!(port.in_flight_len(), 1);
        assert_eq!(ppr.pool().available(), 2);
    }

    #[test]
    #[traced_test]
    fn test_recycle_buffer_sends_or_releases() {
        let port = enabled_port();
        let ppr = PortPoolRef::create(port.clone(), 2).unwrap();

        let buf = ppr.pool().get().unwrap();
        buf.payload().length = 99;
        assert_eq!(ppr.recycle_buffer(buf), Recycled::Sent);
        assert_eq!(port.in_flight_len(), 1);

        let sent = port.take_in_flight().unwrap();
        assert_eq!(sent.payload().length, 0);

        port.reject_all(PortStatus::NotEnabled);
        assert_eq!(ppr.recycle_buffer(sent), Recycled::Released);
        assert_eq!(ppr.pool().available(), 2);
        assert!(logs_contain("WARN"));
        assert!(logs_contain("Recycle send refused"));
    }

    #[test]
    #[traced_test]
    fn test_double_destroy_is_reported() {
        let port = enabled_port();
        let ppr = PortPoolRef::create(port, 1).unwrap();
        let shared = Arc::clone(ppr.shared());
        drop(ppr);

        shared.destroy();
        assert!(logs_contain("destroyed twice"));
    }
}
