//! Pool entries: physically-backed blocks plus their bookkeeping.
//!
//! An entry's bookkeeping is split in two:
//!
//! - [`EntryShared`] holds the block and the atomic reference count. It is
//!   reachable from [`EntryRef`] handles without taking the controller lock.
//! - [`Slot`] holds everything the controller mutates under its lock:
//!   sequence number, dimensions, the source picture and the list links.
//!
//! Slots live in an [`EntryArena`] and are addressed by generation-checked
//! [`EntryId`]s, so a stale id can never reach a recycled slot.

use crate::alloc::{CmaBlock, MemoryAllocator};
use crate::controller::ControllerInner;
use crate::entry_list::{EntryList, LinkStore, Links};
use crate::picture::{same_picture, PictureRef};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Generation-checked address of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: usize,
    generation: u32,
}

impl EntryId {
    /// Arena slot index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation of the slot when this id was issued.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Block and reference count, shared with outstanding [`EntryRef`]s.
///
/// The block is unmapped and freed when the last holder drops this, which
/// is always outside the controller lock.
pub(crate) struct EntryShared {
    pub(crate) block: CmaBlock,
    pub(crate) ref_count: AtomicU32,
    allocator: Arc<dyn MemoryAllocator>,
}

impl EntryShared {
    pub(crate) fn new(block: CmaBlock, allocator: Arc<dyn MemoryAllocator>) -> Self {
        Self {
            block,
            ref_count: AtomicU32::new(1),
            allocator,
        }
    }
}

impl Drop for EntryShared {
    fn drop(&mut self) {
        trace!(
            size = self.block.size(),
            backing_handle = self.block.backing_handle(),
            "Freeing entry block"
        );
        self.allocator.unmap_free(&self.block);
    }
}

/// Controller-side bookkeeping for one entry.
pub(crate) struct Slot {
    pub(crate) shared: Arc<EntryShared>,
    pub(crate) seq: u32,
    pub(crate) width: u32,
    pub(crate) height: u32,
    /// Bytes of staged content.
    pub(crate) content_len: usize,
    /// Picture whose content occupies the block, for reuse matching.
    pub(crate) source_picture: Option<PictureRef>,
    pub(crate) links: Links,
}

impl Slot {
    pub(crate) fn new(shared: Arc<EntryShared>, seq: u32) -> Self {
        Self {
            shared,
            seq,
            width: 0,
            height: 0,
            content_len: 0,
            source_picture: None,
            links: Links::default(),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.shared.block.size()
    }

    pub(crate) fn holds_picture(&self, picture: &PictureRef) -> bool {
        self.source_picture
            .as_ref()
            .is_some_and(|p| same_picture(p, picture))
    }
}

struct ArenaSlot {
    generation: u32,
    slot: Option<Slot>,
}

/// Stable-index storage for every live entry.
#[derive(Default)]
pub(crate) struct EntryArena {
    slots: Vec<ArenaSlot>,
    vacant: Vec<usize>,
    live: usize,
}

impl EntryArena {
    pub(crate) fn insert(&mut self, slot: Slot) -> EntryId {
        self.live += 1;
        if let Some(index) = self.vacant.pop() {
            let cell = &mut self.slots[index];
            cell.slot = Some(slot);
            return EntryId {
                index,
                generation: cell.generation,
            };
        }
        self.slots.push(ArenaSlot {
            generation: 0,
            slot: Some(slot),
        });
        EntryId {
            index: self.slots.len() - 1,
            generation: 0,
        }
    }

    /// Remove the slot at `index`, invalidating every id issued for it.
    pub(crate) fn remove(&mut self, index: usize) -> Option<Slot> {
        let cell = self.slots.get_mut(index)?;
        let slot = cell.slot.take()?;
        cell.generation = cell.generation.wrapping_add(1);
        self.vacant.push(index);
        self.live -= 1;
        Some(slot)
    }

    pub(crate) fn id_of(&self, index: usize) -> EntryId {
        EntryId {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Whether `id` still names a live slot.
    pub(crate) fn is_current(&self, id: EntryId) -> bool {
        self.slots
            .get(id.index)
            .is_some_and(|c| c.generation == id.generation && c.slot.is_some())
    }

    pub(crate) fn slot(&self, index: usize) -> &Slot {
        self.slots[index]
            .slot
            .as_ref()
            .expect("linked index names a vacant slot - internal invariant violated")
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut Slot {
        self.slots[index]
            .slot
            .as_mut()
            .expect("linked index names a vacant slot - internal invariant violated")
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }
}

impl LinkStore for EntryArena {
    fn links(&self, idx: usize) -> &Links {
        &self.slot(idx).links
    }

    fn links_mut(&mut self, idx: usize) -> &mut Links {
        &mut self.slot_mut(idx).links
    }
}

impl EntryList {
    /// Tail-to-head search for the entry staged from `picture`.
    ///
    /// Tail first because the entries submitted earliest in the previous
    /// frame are the ones the next frame asks for first.
    pub(crate) fn find_by_picture(
        &self,
        arena: &EntryArena,
        picture: &PictureRef,
    ) -> Option<usize> {
        self.find_from_tail(arena, |idx| arena.slot(idx).holds_picture(picture))
    }
}

/// Counted reference to an in-use entry.
///
/// Each `EntryRef` accounts for one unit of the entry's reference count:
/// `clone()` adds one, dropping gives it back. When the count reaches zero
/// the entry returns to the controller's free pool.
///
/// While any `EntryRef` is alive the block is not written by the pool, so
/// [`bytes`](Self::bytes) can be read freely.
pub struct EntryRef {
    pool: Arc<ControllerInner>,
    id: EntryId,
    shared: Arc<EntryShared>,
    seq: u32,
}

impl EntryRef {
    /// Wrap a reference the caller already counted.
    pub(crate) fn from_counted(
        pool: Arc<ControllerInner>,
        id: EntryId,
        shared: Arc<EntryShared>,
        seq: u32,
    ) -> Self {
        Self {
            pool,
            id,
            shared,
            seq,
        }
    }

    /// Arena id of the entry.
    #[must_use]
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Sequence number assigned when the entry was last taken from the
    /// free pool. Never zero.
    #[must_use]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Capacity of the backing block.
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.block.size()
    }

    /// Handle the hardware uses to address the block.
    #[must_use]
    pub fn device_handle(&self) -> u32 {
        self.shared.block.device_handle()
    }

    /// Allocator handle of the block.
    #[must_use]
    pub fn backing_handle(&self) -> u32 {
        self.shared.block.backing_handle()
    }

    /// Current reference count (racy; for diagnostics).
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.shared.ref_count.load(Ordering::Acquire)
    }

    /// The whole backing block.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is valid for `size` bytes until the block is
        // freed, which needs our Arc to go away. The pool only writes a
        // block while the producer holds its sole reference, and an
        // `EntryRef` existing means that phase is over.
        unsafe { std::slice::from_raw_parts(self.shared.block.as_ptr(), self.size()) }
    }

    /// Mutable access to the block for a caller that owns the only
    /// reference, as returned by [`PoolController::acquire`](crate::PoolController::acquire).
    ///
    /// Returns `None` if the entry is shared.
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        if self.ref_count() != 1 {
            return None;
        }
        // SAFETY: a count of one held by `self` means no other handle, list
        // or hardware buffer can observe the block while the borrow lives.
        Some(unsafe { std::slice::from_raw_parts_mut(self.shared.block.as_ptr(), self.size()) })
    }
}

impl std::fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryRef")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("size", &self.size())
            .finish()
    }
}

impl Clone for EntryRef {
    fn clone(&self) -> Self {
        self.shared.ref_count.fetch_add(1, Ordering::Relaxed);
        Self {
            pool: Arc::clone(&self.pool),
            id: self.id,
            shared: Arc::clone(&self.shared),
            seq: self.seq,
        }
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        self.pool.recycle(self.id, &self.shared);
    }
}
