//! Contract with the external physically-backed memory allocator.
//!
//! The pool never touches the platform allocator directly. It asks a
//! [`MemoryAllocator`] for a backing handle, maps it, and later unmaps and
//! frees it. Both the allocation and the unmap/free may block, so the
//! controller never calls into the allocator while holding its own lock.

use std::ptr::NonNull;
use thiserror::Error;

/// Failure reported by a [`MemoryAllocator`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// No backing memory of the requested size could be reserved.
    #[error("allocation of {0} bytes failed")]
    Allocate(usize),
    /// The backing handle could not be mapped into the address space.
    #[error("mapping backing handle {0} failed")]
    Map(u32),
    /// The rounded request does not fit in the address space.
    #[error("request of {0} bytes overflows the allocation granularity")]
    TooLarge(usize),
}

/// Result of mapping a backing handle.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    /// CPU address of the first byte.
    pub ptr: NonNull<u8>,
    /// Handle the hardware uses to reference the block.
    pub device_handle: u32,
}

/// A mapped, physically-backed block.
///
/// The mapping stays valid until the block is passed to
/// [`MemoryAllocator::unmap_free`].
#[derive(Debug)]
pub struct CmaBlock {
    size: usize,
    backing_handle: u32,
    device_handle: u32,
    ptr: NonNull<u8>,
}

// SAFETY: CmaBlock is a descriptor for memory owned by the allocator. The
// pointer is only dereferenced by the entry that owns the block, under the
// single-writer rules documented on `EntryRef`.
unsafe impl Send for CmaBlock {}
unsafe impl Sync for CmaBlock {}

impl CmaBlock {
    /// Size of the block in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocator-side handle.
    #[must_use]
    pub fn backing_handle(&self) -> u32 {
        self.backing_handle
    }

    /// Hardware-side handle.
    #[must_use]
    pub fn device_handle(&self) -> u32 {
        self.device_handle
    }

    /// CPU address of the mapping.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

/// External provider of physically-backed memory.
pub trait MemoryAllocator: Send + Sync + 'static {
    /// Reserve `size` bytes and return the backing handle.
    fn allocate(&self, size: usize) -> Result<u32, AllocError>;

    /// Map a backing handle returned by [`allocate`](Self::allocate).
    fn map(&self, backing_handle: u32, size: usize) -> Result<Mapping, AllocError>;

    /// Free a handle that was never mapped (used when mapping fails).
    fn free_handle(&self, backing_handle: u32);

    /// Unmap and free a block. Called exactly once per block.
    fn unmap_free(&self, block: &CmaBlock);

    /// Make `len` bytes starting at `offset` visible to the hardware.
    fn flush(&self, block: &CmaBlock, offset: usize, len: usize);
}

/// Allocate and map a block of exactly `size` bytes.
///
/// A handle whose mapping fails is freed before the error is returned, so
/// nothing is leaked on the failure path.
pub fn allocate_block(
    allocator: &dyn MemoryAllocator,
    size: usize,
) -> Result<CmaBlock, AllocError> {
    let backing_handle = allocator.allocate(size)?;
    match allocator.map(backing_handle, size) {
        Ok(mapping) => Ok(CmaBlock {
            size,
            backing_handle,
            device_handle: mapping.device_handle,
            ptr: mapping.ptr,
        }),
        Err(e) => {
            allocator.free_handle(backing_handle);
            Err(e)
        }
    }
}

/// Round `size` up to a multiple of `granularity` (a power of two).
pub fn round_up(size: usize, granularity: usize) -> Result<usize, AllocError> {
    debug_assert!(granularity.is_power_of_two());
    size.checked_add(granularity - 1)
        .map(|s| s & !(granularity - 1))
        .ok_or(AllocError::TooLarge(size))
}
