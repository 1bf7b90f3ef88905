use core::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

/// A pointer to the base of the virtual region managed by a heap.
///
/// Every block pointer handed out by the heap is derived from this pointer,
/// so all blocks share its provenance. Block state lives out-of-band in the
/// metadata tree; nothing is ever written through this pointer by the
/// allocator itself.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` for the region of `extent` bytes starting at
    /// `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        ptr.addr()
            .get()
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    /// Returns the address one past the end of the region.
    #[inline]
    pub fn limit(self) -> NonZeroUsize {
        NonZeroUsize::new(self.ptr.addr().get() + self.extent).unwrap()
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.ptr.addr() <= addr && addr < self.limit()
    }

    /// Calculates the offset from `self` to `addr`.
    #[inline]
    pub fn offset_to(self, addr: NonZeroUsize) -> usize {
        addr.get().checked_sub(self.ptr.addr().get()).unwrap()
    }

    /// Creates a pointer to the block of `len` bytes at `addr`.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr_and_size(self, addr: NonZeroUsize, len: usize) -> NonNull<[u8]> {
        debug_assert!(self.contains_addr(addr));

        let ptr = self.ptr.as_ptr().with_addr(addr.get());
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr, len);

        unsafe { NonNull::new_unchecked(raw_slice) }
    }
}
