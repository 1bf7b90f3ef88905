//! A lock wrapper for heaps shared between execution contexts.
//!
//! The heap mandates mutual exclusion at the granularity of one instance:
//! the lock is held for the full duration of one `allocate` or `deallocate`
//! call, including any backing-provider hook invocations made inside it.
//! Independent heaps carry independent locks and need no coordination.

use core::{
    alloc::{GlobalAlloc, Layout},
    cmp,
    ptr::{self, NonNull},
};

use spin::{Mutex, MutexGuard};

use crate::{heap::BackingProvider, BackingAllocator, Heap};

/// A [`Heap`] behind a spinlock.
///
/// This is the form in which a heap serves a whole kernel: any execution
/// context may allocate and free through a shared reference. It also
/// implements [`GlobalAlloc`], so a `LockedHeap` can be installed as the
/// `#[global_allocator]`.
#[derive(Debug)]
pub struct LockedHeap<P: BackingProvider, A: BackingAllocator> {
    inner: Mutex<Heap<P, A>>,
}

impl<P: BackingProvider, A: BackingAllocator> LockedHeap<P, A> {
    /// Wraps `heap` in a lock.
    pub const fn new(heap: Heap<P, A>) -> LockedHeap<P, A> {
        LockedHeap {
            inner: Mutex::new(heap),
        }
    }

    /// Acquires the lock, spinning until it is available.
    ///
    /// The provider hooks run while the lock is held, so they must not
    /// re-enter this heap.
    pub fn lock(&self) -> MutexGuard<'_, Heap<P, A>> {
        self.inner.lock()
    }
}

// SAFETY:
//
// - Allocated blocks point to memory owned by the `Heap` and stay valid
//   until it is dropped.
// - `Heap` is not `Clone`, and moving it does not invalidate allocated
//   memory because that memory is behind a pointer.
// - Any pointer to a currently allocated block is safe to deallocate.
unsafe impl<P: BackingProvider, A: BackingAllocator> GlobalAlloc for LockedHeap<P, A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // A block is aligned to its own size class, so serving at least
        // `align` bytes satisfies the layout.
        let size = cmp::max(layout.size(), layout.align());

        match self.inner.lock().allocate(size) {
            Ok(block) => block.cast::<u8>().as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let size = cmp::max(layout.size(), layout.align());

        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.inner.lock().deallocate(ptr, size) };
        }
    }
}
