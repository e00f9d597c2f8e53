//! In-memory collaborators for tests, benchmarks and the soak tool.
//!
//! - [`MockAllocator`]: heap-backed blocks with failure injection and
//!   counters for allocations, frees and flushes.
//! - [`MockPort`]: records sent buffers and fires completions on demand.
//! - [`MockPicture`]: pixel planes held in `bytes::Bytes`.

use crate::alloc::{AllocError, CmaBlock, Mapping, MemoryAllocator};
use crate::header::HeaderRef;
use crate::picture::{Picture, PictureFormat, PlaneView};
use crate::port::{CompletionCallback, DisplayRegion, HardwarePort, PortStatus, SendError};
use bytes::Bytes;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

/// Heap-backed [`MemoryAllocator`].
#[derive(Debug, Default)]
pub struct MockAllocator {
    blocks: Mutex<HashMap<u32, Box<[u8]>>>,
    next_handle: AtomicU32,
    fail_allocations: AtomicUsize,
    fail_maps: AtomicUsize,
    allocations: AtomicU64,
    frees: AtomicU64,
    flushes: AtomicU64,
    flushed_bytes: AtomicU64,
    gate: Mutex<Option<Arc<AllocationGate>>>,
}

/// Holds one `allocate` call until opened.
///
/// Returned by [`MockAllocator::gate_next_allocation`].
#[derive(Debug, Default)]
pub struct AllocationGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    reached: bool,
    open: bool,
}

impl AllocationGate {
    /// Block until the gated `allocate` call has started.
    pub fn wait_reached(&self) {
        let mut state = self.state.lock();
        while !state.reached {
            self.changed.wait(&mut state);
        }
    }

    /// Let the gated call continue.
    pub fn open(&self) {
        self.state.lock().open = true;
        self.changed.notify_all();
    }

    fn pass(&self) {
        let mut state = self.state.lock();
        state.reached = true;
        self.changed.notify_all();
        while !state.open {
            self.changed.wait(&mut state);
        }
    }
}

/// Decrement `counter` if positive; report whether it was.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

impl MockAllocator {
    /// Allocator with no blocks and no failures scheduled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the next call to `allocate` until the returned gate is opened.
    #[must_use]
    pub fn gate_next_allocation(&self) -> Arc<AllocationGate> {
        let gate = Arc::new(AllocationGate::default());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Make the next `n` calls to `allocate` fail.
    pub fn fail_next_allocations(&self, n: usize) {
        self.fail_allocations.store(n, Ordering::Release);
    }

    /// Make the next `n` calls to `map` fail.
    pub fn fail_next_maps(&self, n: usize) {
        self.fail_maps.store(n, Ordering::Release);
    }

    /// Blocks allocated and not yet freed.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Successful `allocate` calls.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Acquire)
    }

    /// Blocks returned through `unmap_free`.
    #[must_use]
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Acquire)
    }

    /// Cache flush calls.
    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }

    /// Bytes covered by all flushes.
    #[must_use]
    pub fn flushed_bytes(&self) -> u64 {
        self.flushed_bytes.load(Ordering::Acquire)
    }
}

impl MemoryAllocator for MockAllocator {
    fn allocate(&self, size: usize) -> Result<u32, AllocError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.pass();
        }
        if take_failure(&self.fail_allocations) {
            return Err(AllocError::Allocate(size));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::AcqRel) + 1;
        self.blocks
            .lock()
            .insert(handle, vec![0u8; size].into_boxed_slice());
        self.allocations.fetch_add(1, Ordering::AcqRel);
        Ok(handle)
    }

    fn map(&self, backing_handle: u32, _size: usize) -> Result<Mapping, AllocError> {
        if take_failure(&self.fail_maps) {
            return Err(AllocError::Map(backing_handle));
        }
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get_mut(&backing_handle)
            .ok_or(AllocError::Map(backing_handle))?;
        let ptr = NonNull::new(block.as_mut_ptr());
        let ptr = ptr.ok_or(AllocError::Map(backing_handle))?;
        Ok(Mapping {
            ptr,
            device_handle: backing_handle | 0xC000_0000,
        })
    }

    fn free_handle(&self, backing_handle: u32) {
        self.blocks.lock().remove(&backing_handle);
    }

    fn unmap_free(&self, block: &CmaBlock) {
        self.blocks.lock().remove(&block.backing_handle());
        self.frees.fetch_add(1, Ordering::AcqRel);
    }

    fn flush(&self, _block: &CmaBlock, _offset: usize, len: usize) {
        self.flushes.fetch_add(1, Ordering::AcqRel);
        self.flushed_bytes.fetch_add(len as u64, Ordering::AcqRel);
    }
}

/// Scriptable [`HardwarePort`].
///
/// Sent buffers stay in flight until completed with
/// [`complete_one`](Self::complete_one)/[`complete_all`](Self::complete_all),
/// taken with [`take_in_flight`](Self::take_in_flight), or returned by
/// `disable`.
pub struct MockPort {
    name: String,
    enabled: AtomicBool,
    callback: Mutex<Option<CompletionCallback>>,
    in_flight: SegQueue<HeaderRef>,
    /// `Some((n, status))`: accept `n` more sends, then fail with `status`.
    accept_budget: Mutex<Option<(usize, PortStatus)>>,
    sent: AtomicUsize,
    regions: Mutex<Vec<DisplayRegion>>,
    disable_thread: Mutex<Option<ThreadId>>,
    disables: AtomicUsize,
}

impl MockPort {
    /// Disabled port that accepts every send once enabled.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            enabled: AtomicBool::new(false),
            callback: Mutex::new(None),
            in_flight: SegQueue::new(),
            accept_budget: Mutex::new(None),
            sent: AtomicUsize::new(0),
            regions: Mutex::new(Vec::new()),
            disable_thread: Mutex::new(None),
            disables: AtomicUsize::new(0),
        }
    }

    /// Accept `n` more sends, then refuse with `status`.
    pub fn reject_after(&self, n: usize, status: PortStatus) {
        *self.accept_budget.lock() = Some((n, status));
    }

    /// Refuse every send with `status`.
    pub fn reject_all(&self, status: PortStatus) {
        self.reject_after(0, status);
    }

    /// Accept every send again.
    pub fn accept_all(&self) {
        *self.accept_budget.lock() = None;
    }

    /// Complete the oldest in-flight buffer. Returns `false` if none.
    pub fn complete_one(&self, status: PortStatus) -> bool {
        let Some(buf) = self.in_flight.pop() else {
            return false;
        };
        let callback = self.callback.lock().clone();
        match callback {
            Some(cb) => cb(buf, status),
            None => drop(buf),
        }
        true
    }

    /// Complete every in-flight buffer. Returns how many.
    pub fn complete_all(&self, status: PortStatus) -> usize {
        let mut n = 0;
        while self.complete_one(status) {
            n += 1;
        }
        n
    }

    /// Remove the oldest in-flight buffer without running the callback.
    #[must_use]
    pub fn take_in_flight(&self) -> Option<HeaderRef> {
        self.in_flight.pop()
    }

    /// Buffers sent and not yet completed.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Successful sends so far.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::Acquire)
    }

    /// Display regions applied so far, oldest first.
    #[must_use]
    pub fn regions(&self) -> Vec<DisplayRegion> {
        self.regions.lock().clone()
    }

    /// Thread that last disabled the port.
    #[must_use]
    pub fn disable_thread(&self) -> Option<ThreadId> {
        *self.disable_thread.lock()
    }

    /// Calls to `disable` that found the port enabled.
    #[must_use]
    pub fn disable_count(&self) -> usize {
        self.disables.load(Ordering::Acquire)
    }
}

impl HardwarePort for MockPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, buffer: HeaderRef) -> Result<(), SendError> {
        if !self.is_enabled() {
            return Err(SendError {
                buffer,
                status: PortStatus::NotEnabled,
            });
        }
        {
            let mut budget = self.accept_budget.lock();
            match budget.as_mut() {
                Some((0, status)) => {
                    return Err(SendError {
                        buffer,
                        status: *status,
                    })
                }
                Some((n, _)) => *n -= 1,
                None => {}
            }
        }
        self.in_flight.push(buffer);
        self.sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn enable(&self, callback: CompletionCallback) -> Result<(), PortStatus> {
        if self.enabled.load(Ordering::Acquire) {
            return Err(PortStatus::Invalid);
        }
        *self.callback.lock() = Some(callback);
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        *self.disable_thread.lock() = Some(std::thread::current().id());
        self.disables.fetch_add(1, Ordering::AcqRel);

        self.complete_all(PortStatus::Ok);
        self.callback.lock().take();
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_display_region(&self, region: &DisplayRegion) -> Result<(), PortStatus> {
        self.regions.lock().push(*region);
        Ok(())
    }
}

impl std::fmt::Debug for MockPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPort")
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .field("in_flight", &self.in_flight_len())
            .finish()
    }
}

#[derive(Debug)]
struct MockPlane {
    pixels: Bytes,
    pitch: usize,
    lines: usize,
}

/// Picture with planes held in `Bytes`.
#[derive(Debug)]
pub struct MockPicture {
    format: PictureFormat,
    planes: Vec<MockPlane>,
    pts: Option<i64>,
}

impl MockPicture {
    /// Single plane of `width * height` bytes, all `value`.
    #[must_use]
    pub fn solid(width: u32, height: u32, value: u8) -> Arc<Self> {
        Arc::new(Self::solid_plane(width, height, value, None))
    }

    /// Like [`solid`](Self::solid) with a presentation timestamp.
    #[must_use]
    pub fn solid_at(width: u32, height: u32, value: u8, pts: i64) -> Arc<Self> {
        Arc::new(Self::solid_plane(width, height, value, Some(pts)))
    }

    /// Planar 4:2:0: luma of `luma`, neutral chroma.
    #[must_use]
    pub fn yuv420(width: u32, height: u32, luma: u8) -> Arc<Self> {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let chroma = || MockPlane {
            pixels: Bytes::from(vec![128u8; cw * ch]),
            pitch: cw,
            lines: ch,
        };
        Arc::new(Self {
            format: PictureFormat {
                width,
                height,
                ..PictureFormat::default()
            },
            planes: vec![
                MockPlane {
                    pixels: Bytes::from(vec![luma; w * h]),
                    pitch: w,
                    lines: h,
                },
                chroma(),
                chroma(),
            ],
            pts: None,
        })
    }

    fn solid_plane(width: u32, height: u32, value: u8, pts: Option<i64>) -> Self {
        let (w, h) = (width as usize, height as usize);
        Self {
            format: PictureFormat {
                width,
                height,
                ..PictureFormat::default()
            },
            planes: vec![MockPlane {
                pixels: Bytes::from(vec![value; w * h]),
                pitch: w,
                lines: h,
            }],
            pts,
        }
    }
}

impl Picture for MockPicture {
    fn format(&self) -> PictureFormat {
        self.format
    }

    fn planes(&self) -> Vec<PlaneView<'_>> {
        self.planes
            .iter()
            .map(|p| PlaneView {
                pixels: &p.pixels,
                pitch: p.pitch,
                lines: p.lines,
            })
            .collect()
    }

    fn pts(&self) -> Option<i64> {
        self.pts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeaderPool;

    #[test]
    fn test_allocator_failure_injection() {
        let allocator = MockAllocator::new();
        allocator.fail_next_allocations(2);
        assert!(allocator.allocate(10).is_err());
        assert!(allocator.allocate(10).is_err());
        assert!(allocator.allocate(10).is_ok());
        assert_eq!(allocator.allocations(), 1);
    }

    fn drop_all() -> CompletionCallback {
        Arc::new(|buf: HeaderRef, _: PortStatus| drop(buf))
    }

    #[test]
    fn test_port_budget() {
        let port = MockPort::new("p");
        let pool = HeaderPool::new(3);
        port.enable(drop_all()).unwrap();
        port.reject_after(1, PortStatus::Again);

        assert!(port.send(pool.get().unwrap()).is_ok());
        let err = port.send(pool.get().unwrap()).unwrap_err();
        assert_eq!(err.status, PortStatus::Again);
        drop(err);

        port.accept_all();
        assert!(port.send(pool.get().unwrap()).is_ok());
        assert_eq!(port.sent_count(), 2);
    }

    #[test]
    fn test_disable_returns_in_flight() {
        let port = MockPort::new("p");
        let pool = HeaderPool::new(2);
        port.enable(drop_all()).unwrap();
        port.send(pool.get().unwrap()).unwrap();
        port.send(pool.get().unwrap()).unwrap();

        port.disable();
        assert_eq!(pool.available(), 2);
        assert!(!port.is_enabled());
        assert_eq!(port.disable_count(), 1);
    }

    #[test]
    fn test_enable_twice_fails() {
        let port = MockPort::new("p");
        port.enable(drop_all()).unwrap();
        assert_eq!(
            port.enable(drop_all()).unwrap_err(),
            PortStatus::Invalid
        );
    }
}
