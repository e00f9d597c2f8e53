//! Hardware buffer headers and the pools that hand them out.
//!
//! A [`BufferHeader`] is what travels to and from a hardware port. It carries
//! a [`Payload`] describing the picture data (usually an [`EntryRef`] into
//! the pool controller) and an atomic reference count.
//!
//! # Release
//!
//! [`HeaderRef`] is the counted handle: `clone()` acquires, `drop` releases.
//! On the last release:
//!
//! 1. a pre-release hook, if installed, is taken out (which uninstalls it)
//!    and called. A hook that returns [`PreRelease::Handled`] has taken over
//!    the header, typically by re-acquiring and re-sending it;
//! 2. otherwise the payload is reset, dropping its entry reference, and the
//!    header goes back to the tail of its [`HeaderPool`]. A header whose pool
//!    was destroyed is dropped instead.

use crate::entry::EntryRef;
use crate::port::Rect;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace};

/// Description of the data a header carries.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    /// Entry holding the pixels, if any. An empty payload blanks a layer.
    pub entry: Option<EntryRef>,
    /// Bytes of valid data.
    pub length: usize,
    /// Offset of the data within the entry.
    pub offset: usize,
    /// Presentation timestamp in microseconds.
    pub pts: Option<i64>,
    /// `Payload::FLAG_*` bits.
    pub flags: u32,
    /// Sequence number of the entry when the payload was filled.
    pub seq: u32,
    /// Picture width in pixels.
    pub width: u32,
    /// Picture height in pixels.
    pub height: u32,
    /// Where the picture goes on the display.
    pub dest_rect: Rect,
    /// Layer alpha, 255 is opaque.
    pub alpha: u8,
}

impl Payload {
    /// Last buffer of a frame.
    pub const FLAG_FRAME_END: u32 = 1 << 2;
    /// End of stream.
    pub const FLAG_EOS: u32 = 1 << 0;
}

/// Outcome of a pre-release hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreRelease {
    /// The hook took over the header; do not return it to its pool.
    Handled,
    /// Continue with the normal release.
    Continue,
}

/// One-shot callback run on the last release of a header.
pub type PreReleaseHook = Box<dyn FnOnce(&Arc<BufferHeader>) -> PreRelease + Send>;

/// A hardware buffer header.
pub struct BufferHeader {
    index: usize,
    refs: AtomicUsize,
    payload: Mutex<Payload>,
    pre_release: Mutex<Option<PreReleaseHook>>,
    home: Weak<HeaderQueue>,
}

impl BufferHeader {
    fn new(index: usize, home: Weak<HeaderQueue>) -> Self {
        Self {
            index,
            refs: AtomicUsize::new(0),
            payload: Mutex::new(Payload::default()),
            pre_release: Mutex::new(None),
            home,
        }
    }

    /// Position of the header within its pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    fn release(header: &Arc<BufferHeader>) {
        let prev = header.refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            header.refs.fetch_add(1, Ordering::AcqRel);
            error!(
                index = header.index,
                "Header released with zero references - protocol violation"
            );
            debug_assert!(false, "header reference count underflow");
            return;
        }
        if prev != 1 {
            return;
        }

        let hook = header.pre_release.lock().take();
        if let Some(hook) = hook {
            if hook(header) == PreRelease::Handled {
                trace!(index = header.index, "Pre-release hook took over header");
                return;
            }
            if header.ref_count() != 0 {
                return;
            }
        }

        let old = std::mem::take(&mut *header.payload.lock());
        drop(old);

        match header.home.upgrade() {
            Some(queue) => queue.put(Arc::clone(header), false),
            None => trace!(index = header.index, "Header pool gone, dropping header"),
        }
    }
}

impl std::fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHeader")
            .field("index", &self.index)
            .field("refs", &self.ref_count())
            .finish_non_exhaustive()
    }
}

/// Counted handle to a [`BufferHeader`].
pub struct HeaderRef {
    header: Option<Arc<BufferHeader>>,
}

impl HeaderRef {
    fn header(&self) -> &Arc<BufferHeader> {
        self.header.as_ref().expect("header already returned")
    }

    /// Take one more reference to a header known to the caller, typically
    /// from inside a pre-release hook.
    #[must_use]
    pub fn reacquire(header: &Arc<BufferHeader>) -> Self {
        header.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            header: Some(Arc::clone(header)),
        }
    }

    /// Position of the header in its pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.header().index
    }

    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.header().ref_count()
    }

    /// Lock the payload. Do not hold the guard across a release.
    pub fn payload(&self) -> MutexGuard<'_, Payload> {
        self.header().payload.lock()
    }

    /// Install a hook to run on the last release, replacing any previous one.
    pub fn set_pre_release(&self, hook: PreReleaseHook) {
        *self.header().pre_release.lock() = Some(hook);
    }

    /// Remove the hook. Returns whether one was installed.
    pub fn clear_pre_release(&self) -> bool {
        self.header().pre_release.lock().take().is_some()
    }

    /// True while a pre-release hook is installed.
    #[must_use]
    pub fn has_pre_release(&self) -> bool {
        self.header().pre_release.lock().is_some()
    }

    /// Whether both handles refer to the same header.
    #[must_use]
    pub fn same_header(&self, other: &HeaderRef) -> bool {
        Arc::ptr_eq(self.header(), other.header())
    }
}

impl Clone for HeaderRef {
    fn clone(&self) -> Self {
        Self::reacquire(self.header())
    }
}

impl Drop for HeaderRef {
    fn drop(&mut self) {
        if let Some(header) = self.header.take() {
            BufferHeader::release(&header);
        }
    }
}

impl std::fmt::Debug for HeaderRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.header {
            Some(h) => h.fmt(f),
            None => f.write_str("HeaderRef(returned)"),
        }
    }
}

struct HeaderQueue {
    free: Mutex<VecDeque<Arc<BufferHeader>>>,
    destroyed: AtomicBool,
    size: usize,
}

impl HeaderQueue {
    /// The destroyed flag is read and written under `free`, so a header
    /// is never queued after `destroy` drained the queue.
    fn put(&self, header: Arc<BufferHeader>, front: bool) {
        let mut free = self.free.lock();
        if self.destroyed.load(Ordering::Acquire) {
            drop(free);
            trace!(index = header.index, "Header pool destroyed, dropping header");
            return;
        }
        if front {
            free.push_front(header);
        } else {
            free.push_back(header);
        }
    }
}

/// FIFO pool of buffer headers.
///
/// Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct HeaderPool {
    queue: Arc<HeaderQueue>,
}

impl HeaderPool {
    /// Create a pool of `count` headers.
    #[must_use]
    pub fn new(count: usize) -> Self {
        let queue = Arc::new_cyclic(|home: &Weak<HeaderQueue>| HeaderQueue {
            free: Mutex::new(
                (0..count)
                    .map(|i| Arc::new(BufferHeader::new(i, home.clone())))
                    .collect(),
            ),
            destroyed: AtomicBool::new(false),
            size: count,
        });
        debug!(count, "HeaderPool created");
        Self { queue }
    }

    /// Take a free header with one reference and an empty payload.
    ///
    /// Returns `None` if the pool is empty or destroyed.
    #[must_use]
    pub fn get(&self) -> Option<HeaderRef> {
        if self.is_destroyed() {
            return None;
        }
        let header = self.queue.free.lock().pop_front()?;
        header.refs.store(1, Ordering::Release);
        Some(HeaderRef {
            header: Some(header),
        })
    }

    /// Return an unsent header to the front of the pool so it is retried first.
    ///
    /// Skips the pre-release hook; the caller is handing back a header it
    /// just took and never gave away.
    pub fn put_back(&self, mut buf: HeaderRef) {
        let Some(header) = buf.header.take() else {
            return;
        };
        let prev = header.refs.swap(0, Ordering::AcqRel);
        if prev != 1 {
            error!(
                index = header.index,
                refs = prev,
                "Header put back while shared - protocol violation"
            );
        }
        header.pre_release.lock().take();
        let old = std::mem::take(&mut *header.payload.lock());
        drop(old);
        self.queue.put(header, true);
    }

    /// Destroy the pool. Free headers are dropped now, outstanding ones
    /// when they are released.
    pub fn destroy(&self) {
        let free = {
            let mut free = self.queue.free.lock();
            if self.queue.destroyed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *free)
        };
        debug!(
            freed = free.len(),
            outstanding = self.queue.size - free.len(),
            "HeaderPool destroyed"
        );
    }

    /// True once [`destroy`](Self::destroy) ran.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.queue.destroyed.load(Ordering::Acquire)
    }

    /// Headers currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.queue.free.lock().len()
    }

    /// Headers the pool was created with.
    #[must_use]
    pub fn size(&self) -> usize {
        self.queue.size
    }
}

impl std::fmt::Debug for HeaderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderPool")
            .field("size", &self.size())
            .field("available", &self.available())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::controller::PoolController;
    use crate::mock::MockAllocator;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_get_and_release() {
        let pool = HeaderPool::new(2);
        assert_eq!(pool.available(), 2);

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert!(pool.get().is_none());
        assert_eq!(a.ref_count(), 1);

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_clone_is_acquire() {
        let pool = HeaderPool::new(1);
        let a = pool.get().unwrap();
        let a2 = a.clone();
        assert_eq!(a.ref_count(), 2);
        assert!(a.same_header(&a2));

        drop(a);
        assert_eq!(pool.available(), 0);
        drop(a2);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_release_is_fifo_and_put_back_is_front() {
        let pool = HeaderPool::new(3);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        let ib = b.index();

        drop(a);
        pool.put_back(b);

        assert_eq!(pool.get().unwrap().index(), ib);
    }

    #[test]
    fn test_release_resets_payload_and_recycles_entry() {
        let allocator = Arc::new(MockAllocator::new());
        let config = PoolConfig::default().with_max_free_entries(4);
        let controller = PoolController::new(&config, allocator).unwrap();
        let pool = HeaderPool::new(1);

        let buf = pool.get().unwrap();
        {
            let mut payload = buf.payload();
            payload.entry = Some(controller.acquire(100).unwrap());
            payload.length = 100;
            payload.seq = 7;
        }
        drop(buf);
        assert_eq!(controller.stats().free, 1);

        let again = pool.get().unwrap();
        let payload = again.payload();
        assert!(payload.entry.is_none());
        assert_eq!(payload.seq, 0);
    }

    #[test]
    fn test_handled_hook_keeps_header_out_of_pool() {
        let pool = HeaderPool::new(1);
        let calls = Arc::new(AtomicU32::new(0));

        let buf = pool.get().unwrap();
        let counter = Arc::clone(&calls);
        buf.set_pre_release(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            PreRelease::Handled
        }));
        drop(buf);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_hook_is_one_shot() {
        let pool = HeaderPool::new(1);
        let calls = Arc::new(AtomicU32::new(0));
        let stash: Arc<Mutex<Option<HeaderRef>>> = Arc::new(Mutex::new(None));

        let buf = pool.get().unwrap();
        let counter = Arc::clone(&calls);
        let keep = Arc::clone(&stash);
        buf.set_pre_release(Box::new(move |header| {
            counter.fetch_add(1, Ordering::SeqCst);
            *keep.lock() = Some(HeaderRef::reacquire(header));
            PreRelease::Handled
        }));
        drop(buf);
        assert_eq!(pool.available(), 0);

        // Second release runs no hook and returns the header.
        let held = stash.lock().take().unwrap();
        assert!(!held.has_pre_release());
        drop(held);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_continue_hook_returns_header() {
        let pool = HeaderPool::new(1);
        let buf = pool.get().unwrap();
        buf.set_pre_release(Box::new(|_| PreRelease::Continue));
        drop(buf);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_clear_pre_release() {
        let pool = HeaderPool::new(1);
        let buf = pool.get().unwrap();
        buf.set_pre_release(Box::new(|_| PreRelease::Handled));
        assert!(buf.clear_pre_release());
        assert!(!buf.clear_pre_release());
        drop(buf);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_destroyed_pool_drops_released_headers() {
        let pool = HeaderPool::new(2);
        let out = pool.get().unwrap();

        pool.destroy();
        assert!(pool.is_destroyed());
        assert_eq!(pool.available(), 0);
        assert!(pool.get().is_none());

        drop(out);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_release_racing_destroy_never_requeues() {
        for _ in 0..200 {
            let pool = HeaderPool::new(8);
            let out: Vec<_> = std::iter::from_fn(|| pool.get()).collect();
            let start = Arc::new(std::sync::Barrier::new(2));

            let releaser = {
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    drop(out);
                })
            };
            start.wait();
            pool.destroy();
            releaser.join().unwrap();

            assert_eq!(pool.available(), 0);
        }
    }

    #[test]
    fn test_header_outlives_pool_handle() {
        let pool = HeaderPool::new(1);
        let buf = pool.get().unwrap();
        drop(pool);
        // Home queue is gone; release just drops the header.
        drop(buf);
    }
}
