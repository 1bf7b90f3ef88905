//! A buddy-system kernel heap allocator with lazily committed backing.
//!
//! This crate manages allocation inside a single contiguous, power-of-two
//! sized virtual region, the way a kernel `kmalloc` does: block state is
//! kept in a compact array-encoded binary tree held out-of-band, every tree
//! walk is iterative over a small bounded stack (kernel stacks are too small
//! to risk recursion inside the allocator), and physical backing for the
//! region is committed and released on demand through caller-supplied
//! map/unmap hooks.
//!
//! The central type is [`Heap`]. It hands out power-of-two blocks aligned to
//! their own size, coalesces buddies synchronously on free, and tracks which
//! alloc-block-aligned regions of its range are currently backed so that the
//! map hook is never invoked twice for a live region.
//!
//! ```
//! use kheap::Heap;
//!
//! // A 64 KiB heap handing out blocks of 16 bytes and up, with the whole
//! // range assumed pre-mapped.
//! let mut heap = Heap::new(1 << 16, 16, 4096).unwrap();
//!
//! let block = heap.allocate(100).unwrap();
//! assert_eq!(block.len(), 128); // rounded up to the block size class
//!
//! unsafe { heap.deallocate(block.cast(), 100) };
//! assert_eq!(heap.used_bytes(), 0);
//! ```
//!
//! Multiple independent heaps may coexist (for example a small identity
//! mapped low-memory heap next to a large lazily backed one); they share no
//! state. For shared access from several execution contexts, wrap a heap in
//! [`LockedHeap`].

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
mod geometry;
mod stack;
mod tree;

pub mod heap;
pub mod locked;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, ptr::NonNull};

use thiserror::Error;

pub use crate::heap::{BackingProvider, Heap, Linear, MapError};
pub use crate::locked::LockedHeap;

/// The error type for heap constructors.
#[derive(Clone, Debug, Error)]
pub enum HeapInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate the
    /// heap region or its metadata storage and the underlying allocator
    /// fails. It contains the [`Layout`] that could not be allocated.
    #[error("failed to allocate heap storage ({0:?})")]
    AllocFailed(Layout),

    /// The configuration of the heap is invalid.
    ///
    /// Returned when the requested geometry cannot be satisfied: a size that
    /// is not a power of two, block sizes out of order, a base address not
    /// aligned to the heap size, or a heap-to-minimum-block ratio deeper
    /// than the fixed traversal stack allows.
    #[error("invalid heap geometry")]
    InvalidConfig,
}

/// The error type returned by allocation operations.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
pub enum AllocError {
    /// No free block of sufficient size is available, or the backing
    /// provider refused to commit the memory the block needs.
    ///
    /// This is recoverable: the heap is left exactly as it was before the
    /// call, and the caller may free memory and retry.
    #[error("out of memory")]
    OutOfMemory,

    /// The request itself is malformed: a zero-size allocation, or a query
    /// for a pointer that does not denote a live block of this heap.
    #[error("invalid argument")]
    InvalidArgument,
}

/// Types which own the storage behind a heap.
///
/// This determines who releases the heap's region and metadata storage when
/// the heap is dropped. It is implemented by the following types:
/// - The [`Raw`] marker type indicates that the heap was constructed from
///   raw pointers and does not own its storage; nothing is released on drop
///   and the pointers can be reclaimed with [`Heap::into_raw_parts`].
/// - The [`Global`] marker type indicates that the storage was obtained from
///   the global allocator and is returned to it on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory *currently allocated* via this
    ///   allocator, and
    /// * `layout` must *fit* that block of memory.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that a heap is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[cfg(any(feature = "alloc", test))]
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
