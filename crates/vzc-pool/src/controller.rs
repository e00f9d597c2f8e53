//! Pool controller: allocation, best-fit reuse, generations and eviction.
//!
//! # Lists
//!
//! Every live entry is in exactly one of:
//!
//! - `free_pool`: reference count zero, available for reuse, bounded by
//!   `max_free` with LRU eviction from the tail;
//! - `current_gen`: staged for the frame being built;
//! - `previous_gen`: staged for the frame before that;
//! - no list at all: handed out and still referenced by hardware buffers.
//!
//! An entry on a generation list holds one "frame affinity" reference on
//! top of one reference per outstanding hardware buffer. Rotating a
//! generation out drops the affinity reference; the entry reaches the free
//! pool once its last buffer comes back.
//!
//! # Locking
//!
//! One `parking_lot::Mutex` guards the arena, the three lists and the
//! sequence counter. Reference counts are atomics touched without the lock,
//! except that the zero crossing is always followed by taking the lock to
//! move the entry. The allocator is never called with the lock held: blocks
//! are allocated before re-locking, and evicted blocks and released
//! pictures are collected in a [`Reclaimed`] that is dropped after unlock.

use crate::alloc::{allocate_block, round_up, MemoryAllocator};
use crate::config::PoolConfig;
use crate::entry::{EntryArena, EntryId, EntryRef, EntryShared, Slot};
use crate::entry_list::EntryList;
use crate::error::{PoolError, PoolResult};
use crate::picture::{stage_planes, PictureRef};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Snapshot of controller state and counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Entries in the free pool.
    pub free: usize,
    /// Entries staged for the current frame.
    pub current_gen: usize,
    /// Entries staged for the previous frame.
    pub previous_gen: usize,
    /// Entries with live backing memory, on a list or not.
    pub live: usize,
    /// Blocks obtained from the allocator.
    pub allocations: u64,
    /// Acquires satisfied from the free pool.
    pub reuse_hits: u64,
    /// Submissions satisfied by identity match in a generation list.
    pub cache_hits: u64,
    /// Submissions that staged picture content into an entry.
    pub copies: u64,
    /// Free-pool entries evicted to honour `max_free`.
    pub evictions: u64,
}

/// Result of [`PoolController::submit_for_frame`].
#[derive(Debug)]
pub struct FrameEntry {
    /// Reference for one hardware buffer.
    pub entry: EntryRef,
    /// Bytes of staged content.
    pub len: usize,
    /// Width of the staged picture.
    pub width: u32,
    /// Height of the staged picture.
    pub height: u32,
    /// Whether content was copied by this call (`false` on a cache hit).
    pub copied: bool,
}

#[derive(Default)]
struct Counters {
    allocations: AtomicU64,
    reuse_hits: AtomicU64,
    cache_hits: AtomicU64,
    copies: AtomicU64,
    evictions: AtomicU64,
}

/// State guarded by the controller mutex.
struct PoolState {
    arena: EntryArena,
    free_pool: EntryList,
    current_gen: EntryList,
    previous_gen: EntryList,
    seq_counter: u32,
}

impl PoolState {
    /// Next sequence number, skipping zero on wraparound.
    fn next_seq(&mut self) -> u32 {
        self.seq_counter = self.seq_counter.wrapping_add(1);
        if self.seq_counter == 0 {
            self.seq_counter = 1;
        }
        self.seq_counter
    }
}

/// Things released under the lock that must be dropped after it.
///
/// Dropping a slot may unmap and free its block; dropping a picture runs
/// the picture's own release logic. Neither may happen under the lock.
#[derive(Default)]
struct Reclaimed {
    slots: Vec<Slot>,
    pictures: Vec<PictureRef>,
}

/// Shared controller state. Held by [`PoolController`] and every [`EntryRef`].
pub(crate) struct ControllerInner {
    state: Mutex<PoolState>,
    allocator: Arc<dyn MemoryAllocator>,
    max_free: usize,
    granularity: usize,
    max_per_frame: usize,
    counters: Counters,
}

/// Handle to a buffer pool controller.
///
/// Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct PoolController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for PoolController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolController")
            .field("max_free", &self.inner.max_free)
            .field("granularity", &self.inner.granularity)
            .field("max_per_frame", &self.inner.max_per_frame)
            .finish_non_exhaustive()
    }
}

impl PoolController {
    /// Create a controller.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: &PoolConfig, allocator: Arc<dyn MemoryAllocator>) -> PoolResult<Self> {
        config.validate()?;
        let max_free = config.resolved_max_free_entries();

        info!(
            max_free,
            granularity = config.granularity,
            max_per_frame = config.max_per_frame,
            "PoolController created"
        );

        Ok(Self {
            inner: Arc::new(ControllerInner {
                state: Mutex::new(PoolState {
                    arena: EntryArena::default(),
                    free_pool: EntryList::new(),
                    current_gen: EntryList::new(),
                    previous_gen: EntryList::new(),
                    seq_counter: 0,
                }),
                allocator,
                max_free,
                granularity: config.granularity,
                max_per_frame: config.max_per_frame,
                counters: Counters::default(),
            }),
        })
    }

    /// Take an entry of at least `requested_size` bytes.
    ///
    /// Reuses the smallest free entry no larger than
    /// `2 * requested_size + granularity`, otherwise allocates a new block of
    /// `requested_size` rounded up to the granularity. The returned
    /// reference is the only one; dropping it returns the entry to the free
    /// pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::OutOfMemory`] if a new block was needed and the allocator
    /// failed. No pool state changes in that case.
    pub fn acquire(&self, requested_size: usize) -> PoolResult<EntryRef> {
        let (id, shared, seq) = self.inner.acquire_raw(requested_size)?;
        Ok(EntryRef::from_counted(Arc::clone(&self.inner), id, shared, seq))
    }

    /// Resolve an entry holding `picture`'s content for the frame being built.
    ///
    /// `is_first` marks the first picture of a new frame and rotates the
    /// generations. It is a hint: a picture already staged in either
    /// generation is reused even if the hint was missed, and the current
    /// generation also rotates once it reaches `max_per_frame` entries.
    ///
    /// On a cache hit nothing is copied and the entry keeps its sequence
    /// number, so consumers comparing `seq` see no change. On a miss a new
    /// entry is acquired, the picture is staged and flushed.
    ///
    /// # Errors
    ///
    /// [`PoolError::OutOfMemory`] if staging needed a new block and the
    /// allocator failed. The picture is then not delivered for this frame.
    pub fn submit_for_frame(&self, picture: &PictureRef, is_first: bool) -> PoolResult<FrameEntry> {
        self.inner.submit_for_frame(picture, is_first)
    }

    /// Drop both generations and free every entry in the free pool.
    ///
    /// Entries still referenced by hardware buffers stay alive and go to
    /// the free pool when they return.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Snapshot of list sizes and counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// Capacity bound of the free pool.
    #[must_use]
    pub fn max_free(&self) -> usize {
        self.inner.max_free
    }

    /// Allocation granularity in bytes.
    #[must_use]
    pub fn granularity(&self) -> usize {
        self.inner.granularity
    }
}

impl ControllerInner {
    fn acquire_raw(&self, requested_size: usize) -> PoolResult<(EntryId, Arc<EntryShared>, u32)> {
        let limit = requested_size
            .saturating_mul(2)
            .saturating_add(self.granularity);

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let best = state
                .free_pool
                .iter(&state.arena)
                .map(|idx| (idx, state.arena.slot(idx).size()))
                .filter(|&(_, size)| size >= requested_size && size <= limit)
                .min_by_key(|&(_, size)| size);

            if let Some((idx, size)) = best {
                state.free_pool.extract(&mut state.arena, idx);
                let seq = state.next_seq();
                let id = state.arena.id_of(idx);
                let slot = state.arena.slot_mut(idx);
                slot.seq = seq;
                slot.shared.ref_count.store(1, Ordering::Release);
                let shared = Arc::clone(&slot.shared);
                drop(guard);

                self.counters.reuse_hits.fetch_add(1, Ordering::Relaxed);
                trace!(requested_size, size, seq, "Reused free entry");
                return Ok((id, shared, seq));
            }
        }

        let size = round_up(requested_size.max(1), self.granularity).map_err(|source| {
            PoolError::OutOfMemory {
                requested: requested_size,
                source,
            }
        })?;

        // Allocation may block; the lock is not held here.
        let block = allocate_block(&*self.allocator, size).map_err(|source| {
            warn!(size, error = %source, "Entry allocation failed");
            PoolError::OutOfMemory {
                requested: size,
                source,
            }
        })?;
        let shared = Arc::new(EntryShared::new(block, Arc::clone(&self.allocator)));

        let (id, seq) = {
            let mut state = self.state.lock();
            let seq = state.next_seq();
            let id = state.arena.insert(Slot::new(Arc::clone(&shared), seq));
            (id, seq)
        };

        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        debug!(requested_size, size, seq, "Allocated new entry");
        Ok((id, shared, seq))
    }

    /// Give back one reference; at zero the entry joins the free pool.
    pub(crate) fn recycle(&self, id: EntryId, shared: &EntryShared) {
        let prev = shared.ref_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            shared.ref_count.fetch_add(1, Ordering::AcqRel);
            error!(?id, "Entry reference count underflow - protocol violation");
            debug_assert!(false, "entry reference count underflow");
            return;
        }
        if prev != 1 {
            return;
        }

        let mut reclaimed = Reclaimed::default();
        {
            let mut guard = self.state.lock();
            if !guard.arena.is_current(id) {
                error!(?id, "Recycling an entry that is no longer live - protocol violation");
                debug_assert!(false, "recycled a stale entry id");
                return;
            }
            self.put_free_locked(&mut guard, id.index(), &mut reclaimed);
        }
        drop(reclaimed);
    }

    /// Move an unreferenced entry to the head of the free pool, evicting
    /// the LRU tail first if the pool is full.
    fn put_free_locked(&self, state: &mut PoolState, idx: usize, reclaimed: &mut Reclaimed) {
        if let Some(picture) = state.arena.slot_mut(idx).source_picture.take() {
            reclaimed.pictures.push(picture);
        }

        if state.free_pool.len() >= self.max_free {
            if let Some(tail) = state.free_pool.extract_tail(&mut state.arena) {
                if let Some(slot) = state.arena.remove(tail) {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        seq = slot.seq,
                        size = slot.size(),
                        free = state.free_pool.len(),
                        "Evicting LRU free entry"
                    );
                    reclaimed.slots.push(slot);
                }
            }
        }

        state.free_pool.add_head(&mut state.arena, idx);
    }

    /// Drop the frame-affinity reference of an entry already unlinked from
    /// its generation list.
    fn drop_affinity_locked(&self, state: &mut PoolState, idx: usize, reclaimed: &mut Reclaimed) {
        let prev = state
            .arena
            .slot(idx)
            .shared
            .ref_count
            .fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.put_free_locked(state, idx, reclaimed);
        }
    }

    /// Retire `previous_gen` and make `current_gen` the previous one.
    fn rotate_locked(&self, state: &mut PoolState, reclaimed: &mut Reclaimed) {
        let retired = state.previous_gen.len();
        while let Some(idx) = state.previous_gen.extract_tail(&mut state.arena) {
            self.drop_affinity_locked(state, idx, reclaimed);
        }

        let PoolState {
            arena,
            current_gen,
            previous_gen,
            ..
        } = state;
        current_gen.move_into(arena, previous_gen);

        trace!(retired, kept = state.previous_gen.len(), "Rotated generations");
    }

    /// Unlink the entry holding `picture` from whichever generation has it.
    fn take_matching_locked(&self, state: &mut PoolState, picture: &PictureRef) -> Option<usize> {
        if let Some(idx) = state.previous_gen.find_by_picture(&state.arena, picture) {
            state.previous_gen.extract(&mut state.arena, idx);
            return Some(idx);
        }
        // Reached when the frame-start hint was missed.
        if let Some(idx) = state.current_gen.find_by_picture(&state.arena, picture) {
            state.current_gen.extract(&mut state.arena, idx);
            debug!(idx, "Matched picture in current generation");
            return Some(idx);
        }
        None
    }

    /// Link `idx` at the head of `current_gen` and hand out a buffer reference.
    fn attach_locked(
        self: &Arc<Self>,
        state: &mut PoolState,
        idx: usize,
        copied: bool,
    ) -> FrameEntry {
        state.current_gen.add_head(&mut state.arena, idx);

        let id = state.arena.id_of(idx);
        let slot = state.arena.slot(idx);
        slot.shared.ref_count.fetch_add(1, Ordering::AcqRel);

        FrameEntry {
            entry: EntryRef::from_counted(Arc::clone(self), id, Arc::clone(&slot.shared), slot.seq),
            len: slot.content_len,
            width: slot.width,
            height: slot.height,
            copied,
        }
    }

    fn submit_for_frame(
        self: &Arc<Self>,
        picture: &PictureRef,
        is_first: bool,
    ) -> PoolResult<FrameEntry> {
        let mut reclaimed = Reclaimed::default();
        let hit = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if is_first || state.current_gen.len() >= self.max_per_frame {
                self.rotate_locked(state, &mut reclaimed);
            }
            self.take_matching_locked(state, picture)
                .map(|idx| self.attach_locked(state, idx, false))
        };
        drop(reclaimed);

        if let Some(frame) = hit {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            trace!(seq = frame.entry.seq(), "Reusing staged entry");
            return Ok(frame);
        }

        // Miss: the acquired reference becomes the frame-affinity reference.
        let (id, shared, seq) = self.acquire_raw(picture.footprint())?;
        let format = picture.format();

        // SAFETY: the producer holds the only reference and the entry is on
        // no list, so nothing else reads or writes the block.
        let dst =
            unsafe { std::slice::from_raw_parts_mut(shared.block.as_ptr(), shared.block.size()) };
        let len = stage_planes(&**picture, dst);
        self.allocator.flush(&shared.block, 0, len);
        self.counters.copies.fetch_add(1, Ordering::Relaxed);

        let mut reclaimed = Reclaimed::default();
        let frame = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if let Some(idx) = self.take_matching_locked(state, picture) {
                // Another producer staged the same picture meanwhile; keep
                // theirs so the picture has a single live entry.
                debug!(seq, "Lost staging race, discarding duplicate entry");
                let frame = self.attach_locked(state, idx, false);
                if shared.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.put_free_locked(state, id.index(), &mut reclaimed);
                }
                frame
            } else {
                let slot = state.arena.slot_mut(id.index());
                slot.source_picture = Some(Arc::clone(picture));
                slot.width = format.width;
                slot.height = format.height;
                slot.content_len = len;
                self.attach_locked(state, id.index(), true)
            }
        };
        drop(reclaimed);

        debug!(seq, len, width = format.width, height = format.height, "Staged picture");
        Ok(frame)
    }

    fn shutdown(&self) {
        let mut reclaimed = Reclaimed::default();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            self.rotate_locked(state, &mut reclaimed);
            self.rotate_locked(state, &mut reclaimed);

            while let Some(idx) = state.free_pool.extract_tail(&mut state.arena) {
                if let Some(mut slot) = state.arena.remove(idx) {
                    if let Some(picture) = slot.source_picture.take() {
                        reclaimed.pictures.push(picture);
                    }
                    reclaimed.slots.push(slot);
                }
            }

            info!(
                freed = reclaimed.slots.len(),
                still_referenced = state.arena.live(),
                "PoolController shut down"
            );
        }
        drop(reclaimed);
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            free: state.free_pool.len(),
            current_gen: state.current_gen.len(),
            previous_gen: state.previous_gen.len(),
            live: state.arena.live(),
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            reuse_hits: self.counters.reuse_hits.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            copies: self.counters.copies.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        // No EntryRef can exist any more; the arena frees every block.
        debug!(live = self.state.get_mut().arena.live(), "Dropping pool controller");
    }
}
