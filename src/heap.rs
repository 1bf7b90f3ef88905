//! The heap descriptor and its allocation, free and coalescing algorithms.
//!
//! A [`Heap`] owns one power-of-two virtual range and the metadata tree
//! describing it. Allocation is an iterative depth-first descent of the
//! tree over the bounded [traversal stack], preferring the lower-address
//! child at every step, so placement is deterministic first-fit. Freeing
//! locates the owning node by address arithmetic in O(1) and merges free
//! buddies upward synchronously.
//!
//! Unless the heap is linearly mapped, it lazily commits backing for the
//! `alloc_block_size`-aligned regions a new block spans, through the
//! [`BackingProvider`] hooks, and releases regions again once no live block
//! overlaps them.
//!
//! [traversal stack]: crate::stack

use core::{alloc::Layout, fmt, mem::ManuallyDrop, num::NonZeroUsize, ops::Range, ptr::NonNull};

use log::{debug, error, trace, warn};
use thiserror::Error;

use crate::{
    base::BasePtr,
    bitmap::Bitmap,
    geometry::Geometry,
    stack::TraversalStack,
    tree::{NodeRef, NodeState, Tree},
    AllocError, BackingAllocator, HeapInitError, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// The error type returned by a backing provider's map hook.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
#[error("backing provider failed to map region")]
pub struct MapError;

/// Types which commit and release physical backing for a heap's virtual
/// range.
///
/// The heap never allocates physical memory itself; when an allocation
/// lands in a part of the range with no live backing, it asks its provider
/// to commit it, and once a committed region holds no live block it hands
/// the region back.
pub trait BackingProvider {
    /// When `true`, the heap's whole range is assumed permanently backed
    /// and the hooks are never invoked.
    const LINEAR: bool = false;

    /// Maps and commits `len` bytes of the heap's range starting `offset`
    /// bytes from its base.
    ///
    /// `offset` and `len` are always multiples of the heap's
    /// `alloc_block_size`, and the heap never calls this twice for the same
    /// region without an intervening [`unmap`](BackingProvider::unmap).
    /// The hook must be bounded and must not re-enter the heap it backs.
    fn map(&mut self, offset: usize, len: usize) -> Result<(), MapError>;

    /// Unmaps and releases `len` bytes starting `offset` bytes from the
    /// base.
    ///
    /// Must not fail; release errors are the provider's problem, not the
    /// heap's.
    fn unmap(&mut self, offset: usize, len: usize);
}

/// A provider for heaps whose range is permanently mapped.
///
/// Used for identity-mapped low-memory heaps: the hooks are never invoked
/// and the commit bookkeeping compiles out.
#[derive(Clone, Debug, Default)]
pub struct Linear;

impl BackingProvider for Linear {
    const LINEAR: bool = true;

    fn map(&mut self, _offset: usize, _len: usize) -> Result<(), MapError> {
        Ok(())
    }

    fn unmap(&mut self, _offset: usize, _len: usize) {}
}

/// Returns the layout of the virtual region for a heap with the given
/// geometry.
///
/// The alignment equals `size`, which guarantees that every block the heap
/// hands out is aligned to its own size.
pub fn region_layout(
    size: usize,
    min_block_size: usize,
    alloc_block_size: usize,
) -> Result<Layout, HeapInitError> {
    Ok(Geometry::new(size, min_block_size, alloc_block_size)?.region_layout())
}

/// Returns the layout of the metadata storage for a heap with the given
/// geometry.
///
/// The metadata holds the node-state tree and the committed-region bitmap;
/// it is sized once at creation time and never grows.
pub fn metadata_layout(
    size: usize,
    min_block_size: usize,
    alloc_block_size: usize,
) -> Result<Layout, HeapInitError> {
    let geometry = Geometry::new(size, min_block_size, alloc_block_size)?;
    Ok(metadata_parts(&geometry).0)
}

/// Returns the combined metadata layout and the byte offset of the
/// committed-region bitmap within it.
fn metadata_parts(geometry: &Geometry) -> (Layout, usize) {
    let nodes = Tree::nodes_layout(geometry.num_nodes);
    let committed = Bitmap::map_layout(geometry.num_regions);

    let (full, bitmap_offset) = nodes.extend(committed).expect("metadata layout error");
    (full.pad_to_align(), bitmap_offset)
}

/// A buddy-system heap over one contiguous virtual range.
///
/// The type takes two parameters:
/// - `P` commits and releases physical backing for the range
///   ([`Linear`] for permanently mapped heaps).
/// - `A` owns the storage behind the heap ([`Raw`] when constructed from
///   raw pointers, [`Global`] when backed by the global allocator).
///
/// Methods take `&mut self`; a heap shared between execution contexts must
/// be wrapped in a lock held for whole calls, see
/// [`LockedHeap`](crate::LockedHeap).
pub struct Heap<P: BackingProvider, A: BackingAllocator> {
    /// Pointer to the virtual range managed by this heap.
    base: BasePtr,
    geometry: Geometry,
    /// Total bytes currently handed out, in whole-block terms.
    bytes_allocated: usize,
    /// Pointer to the region that backs the tree and the bitmap.
    metadata: NonNull<u8>,
    tree: Tree,
    committed: Bitmap,
    provider: P,
    backing_allocator: A,
}

// SAFETY: A heap exclusively owns its region and metadata storage; sending
// it to another thread moves that ownership with it.
unsafe impl<P: BackingProvider + Send, A: BackingAllocator + Send> Send for Heap<P, A> {}

impl<P: BackingProvider> Heap<P, Raw> {
    /// Constructs a new `Heap` from raw pointers.
    ///
    /// `size`, `min_block_size` and `alloc_block_size` must be powers of two
    /// with `min_block_size <= alloc_block_size <= size`, `region` must be
    /// aligned to `size`, and the tree depth implied by
    /// `size / min_block_size` must fit the fixed traversal stack;
    /// otherwise [`HeapInitError::InvalidConfig`] is returned.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be valid for reads and writes for `size` bytes for
    ///   the lifetime of the heap (for non-linear heaps, whenever the
    ///   provider has the spanned regions committed).
    /// - `metadata` must point to a region that satisfies the [`Layout`]
    ///   returned by [`metadata_layout`] for the same geometry, valid for
    ///   reads and writes for its entire size.
    pub unsafe fn new_raw(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
        size: usize,
        min_block_size: usize,
        alloc_block_size: usize,
        provider: P,
    ) -> Result<Heap<P, Raw>, HeapInitError> {
        let geometry = Geometry::new(size, min_block_size, alloc_block_size)?;
        geometry.check_base(region.addr().get())?;

        Ok(unsafe { Heap::from_raw_parts(metadata, region, geometry, provider, Raw) })
    }

    /// Decomposes the heap into its metadata pointer, region pointer and
    /// provider.
    ///
    /// Backing committed through the provider is left mapped; the caller
    /// takes responsibility for it along with the returned provider.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is
    /// called; the returned region pointer becomes the sole owner of the
    /// range. All blocks allocated from this heap should be either freed or
    /// forgotten before calling this method.
    pub unsafe fn into_raw_parts(self) -> (NonNull<u8>, NonNull<u8>, P) {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the provider is moved out
        // exactly once.
        let provider = unsafe { core::ptr::read(&this.provider) };

        (this.metadata, this.base.ptr(), provider)
    }
}

#[cfg(any(feature = "alloc", test))]
impl Heap<Linear, Global> {
    /// Constructs a linearly mapped `Heap` backed by the global allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometry is invalid or if allocating the
    /// region or metadata storage fails.
    pub fn new(
        size: usize,
        min_block_size: usize,
        alloc_block_size: usize,
    ) -> Result<Heap<Linear, Global>, HeapInitError> {
        Heap::with_provider(size, min_block_size, alloc_block_size, Linear)
    }
}

#[cfg(any(feature = "alloc", test))]
impl<P: BackingProvider> Heap<P, Global> {
    /// Constructs a `Heap` backed by the global allocator, with `provider`
    /// in charge of committing the range.
    ///
    /// # Errors
    ///
    /// Returns an error if the geometry is invalid or if allocating the
    /// region or metadata storage fails.
    pub fn with_provider(
        size: usize,
        min_block_size: usize,
        alloc_block_size: usize,
        provider: P,
    ) -> Result<Heap<P, Global>, HeapInitError> {
        let geometry = Geometry::new(size, min_block_size, alloc_block_size)?;
        let region_layout = geometry.region_layout();
        let (metadata_layout, _) = metadata_parts(&geometry);

        unsafe {
            let region = NonNull::new(alloc::alloc::alloc(region_layout))
                .ok_or(HeapInitError::AllocFailed(region_layout))?;

            let metadata = match NonNull::new(alloc::alloc::alloc(metadata_layout)) {
                Some(metadata) => metadata,
                None => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    return Err(HeapInitError::AllocFailed(metadata_layout));
                }
            };

            // The region layout's alignment makes this infallible.
            if let Err(e) = geometry.check_base(region.addr().get()) {
                alloc::alloc::dealloc(region.as_ptr(), region_layout);
                alloc::alloc::dealloc(metadata.as_ptr(), metadata_layout);
                return Err(e);
            }

            Ok(Heap::from_raw_parts(metadata, region, geometry, provider, Global))
        }
    }
}

impl<P: BackingProvider, A: BackingAllocator> Heap<P, A> {
    /// Assembles a heap from validated parts.
    ///
    /// # Safety
    ///
    /// `metadata` and `region` must satisfy the layouts for `geometry` as
    /// described on [`Heap::new_raw`], and `region`'s address must have
    /// passed [`Geometry::check_base`].
    unsafe fn from_raw_parts(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
        geometry: Geometry,
        provider: P,
        backing_allocator: A,
    ) -> Heap<P, A> {
        let (_, bitmap_offset) = metadata_parts(&geometry);

        let tree = unsafe { Tree::new(geometry.num_nodes, metadata.as_ptr()) };
        let committed = unsafe {
            Bitmap::new(
                geometry.num_regions,
                metadata.as_ptr().add(bitmap_offset).cast::<usize>(),
            )
        };

        debug!(
            "heap created: base={:#x} size={} min_block={} alloc_block={} linear={}",
            region.addr(),
            geometry.size,
            geometry.min_block_size,
            geometry.alloc_block_size,
            P::LINEAR,
        );

        Heap {
            base: BasePtr::new(region, geometry.size),
            geometry,
            bytes_allocated: 0,
            metadata,
            tree,
            committed,
            provider,
            backing_allocator,
        }
    }

    /// Returns the total size of the heap in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.geometry.size
    }

    /// Returns the number of bytes currently allocated.
    ///
    /// Blocks are counted at their rounded power-of-two size, not at the
    /// size the caller requested.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.bytes_allocated
    }

    /// Returns a reference to the backing provider.
    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns a mutable reference to the backing provider.
    #[inline]
    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// The request is rounded up to the nearest power-of-two size class no
    /// smaller than the heap's minimum block size; the returned pointer
    /// covers the whole class and is aligned to it. Among equally eligible
    /// free blocks the lowest address wins, so placement is reproducible.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] for zero-size requests, and
    /// [`AllocError::OutOfMemory`] when no block fits or the backing
    /// provider refuses to commit the memory the block needs. In the latter
    /// case the heap is left exactly as it was before the call.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidArgument);
        }

        if size > self.geometry.size {
            warn!(
                "allocation of {size} bytes exceeds heap capacity {}",
                self.geometry.size
            );
            return Err(AllocError::OutOfMemory);
        }

        let target_level = self.geometry.level_for(size);
        let node = match self.claim_free_node(target_level) {
            Some(node) => node,
            None => {
                warn!("heap exhausted: no free block for {size} bytes");
                return Err(AllocError::OutOfMemory);
            }
        };

        let offset = self.geometry.node_offset(node);
        let block_size = self.geometry.block_size(node.level);

        if !P::LINEAR {
            let spanned = self.geometry.regions_spanned(offset, block_size);
            if let Err(failed) = self.commit_regions(spanned.clone()) {
                // Surface the failure only after restoring the tree and
                // releasing whatever this call mapped, so no partial state
                // is visible to later calls.
                self.tree.set_state(node.index, NodeState::Free);
                self.coalesce_up(node);
                self.release_regions(spanned.start..failed);
                return Err(AllocError::OutOfMemory);
            }
        }

        self.bytes_allocated += block_size;

        let addr = NonZeroUsize::new(self.base.addr().get() + offset).unwrap();
        Ok(self.base.with_addr_and_size(addr, block_size))
    }

    /// Frees the block at `ptr`.
    ///
    /// `size` must be the value passed to the [`allocate`](Heap::allocate)
    /// call that returned the block; the heap recomputes the size class
    /// from it. Callers that do not track request sizes can recover the
    /// class with [`size_of`](Heap::size_of).
    ///
    /// Free buddies are merged immediately, and any backing region left
    /// with no live block is released through the unmap hook.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this heap, and
    /// `size` must round to the same size class as the original request.
    /// Violations are caught defensively: they are fatal in debug builds
    /// and rejected (with an error log) in release builds.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        let addr = ptr.addr();

        if size == 0 || size > self.geometry.size || !self.base.contains_addr(addr) {
            debug_assert!(false, "free of {addr:#x} (size {size}): not a block of this heap");
            error!("rejecting free of {addr:#x} (size {size}): not a block of this heap");
            return;
        }

        let offset = self.base.offset_to(addr);
        let level = self.geometry.level_for(size);
        let block_size = self.geometry.block_size(level);

        if offset & (block_size - 1) != 0 {
            debug_assert!(false, "free of {addr:#x}: misaligned for size class {block_size}");
            error!("rejecting free of {addr:#x}: misaligned for size class {block_size}");
            return;
        }

        let node = self.geometry.node_at(level, offset);
        if self.tree.state(node.index) != NodeState::Allocated {
            debug_assert!(false, "free of {addr:#x}: no allocated block of size class {block_size}");
            error!("rejecting free of {addr:#x}: no allocated block of size class {block_size}");
            return;
        }

        self.tree.set_state(node.index, NodeState::Free);
        self.bytes_allocated -= block_size;
        self.coalesce_up(node);

        if !P::LINEAR {
            self.release_regions(self.geometry.regions_spanned(offset, block_size));
        }
    }

    /// Returns the size of the allocated block at `ptr`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] if `ptr` is outside the
    /// heap's range or does not point to the start of a live block.
    pub fn size_of(&self, ptr: NonNull<u8>) -> Result<usize, AllocError> {
        let addr = ptr.addr();
        if !self.base.contains_addr(addr) {
            return Err(AllocError::InvalidArgument);
        }

        let offset = self.base.offset_to(addr);
        let mut node = NodeRef::ROOT;

        // The perfect subdivision of the range means the owning node sits
        // on the unique root-to-leaf path toward `offset`.
        loop {
            match self.tree.state(node.index) {
                NodeState::Free => return Err(AllocError::InvalidArgument),
                NodeState::Allocated => {
                    if self.geometry.node_offset(node) == offset {
                        return Ok(self.geometry.block_size(node.level));
                    }

                    // Interior pointer.
                    return Err(AllocError::InvalidArgument);
                }
                NodeState::Split => node = self.geometry.child_toward(node, offset),
            }
        }
    }

    /// Finds, splits toward and claims the lowest-address free block at
    /// `target_level`.
    ///
    /// The walk is an iterative depth-first descent driven by the explicit
    /// stack. The lower-address child is pushed last so it is visited
    /// first; free blocks above the target level are split in place on the
    /// way down.
    fn claim_free_node(&mut self, target_level: u32) -> Option<NodeRef> {
        let mut stack = TraversalStack::new();
        stack.push(NodeRef::ROOT);

        while let Some(node) = stack.pop() {
            match self.tree.state(node.index) {
                NodeState::Allocated => {}
                NodeState::Free if node.level == target_level => {
                    self.tree.set_state(node.index, NodeState::Allocated);
                    return Some(node);
                }
                NodeState::Free => {
                    // Both halves of a free block are free; the descent
                    // claims the lower one next.
                    self.tree.set_state(node.index, NodeState::Split);
                    stack.push(node.right_child());
                    stack.push(node.left_child());
                }
                NodeState::Split if node.level == target_level => {}
                NodeState::Split => {
                    stack.push(node.right_child());
                    stack.push(node.left_child());
                }
            }
        }

        None
    }

    /// Merges free buddies upward starting from `node`, which must already
    /// be marked free.
    fn coalesce_up(&mut self, mut node: NodeRef) {
        debug_assert_eq!(self.tree.state(node.index), NodeState::Free);

        while let Some((parent, buddy)) = node.parent_and_buddy() {
            if self.tree.state(buddy.index) != NodeState::Free {
                break;
            }

            debug_assert_eq!(self.tree.state(parent.index), NodeState::Split);
            self.tree.set_state(parent.index, NodeState::Free);
            node = parent;
        }
    }

    /// Commits every not-yet-committed region in `regions`.
    ///
    /// On failure returns the index of the region the provider refused;
    /// regions before it that this call mapped remain committed and must be
    /// rolled back by the caller.
    fn commit_regions(&mut self, regions: Range<usize>) -> Result<(), usize> {
        let region_len = self.geometry.alloc_block_size;

        for region in regions {
            if self.committed.get(region) {
                continue;
            }

            let region_offset = region << self.geometry.alloc_block_size_log2;
            trace!("mapping heap region at offset {region_offset:#x} ({region_len} bytes)");

            if self.provider.map(region_offset, region_len).is_err() {
                warn!("backing provider refused heap region at offset {region_offset:#x}");
                return Err(region);
            }

            self.committed.set(region, true);
        }

        Ok(())
    }

    /// Releases every committed region in `regions` that no live block
    /// overlaps.
    fn release_regions(&mut self, regions: Range<usize>) {
        let region_len = self.geometry.alloc_block_size;

        for region in regions {
            if !self.committed.get(region) || !self.region_fully_free(region) {
                continue;
            }

            let region_offset = region << self.geometry.alloc_block_size_log2;
            trace!("unmapping heap region at offset {region_offset:#x} ({region_len} bytes)");

            self.provider.unmap(region_offset, region_len);
            self.committed.set(region, false);
        }
    }

    /// Returns whether no live block overlaps the given backing region.
    fn region_fully_free(&self, region: usize) -> bool {
        let region_level = self.geometry.region_level();
        let offset = region << self.geometry.alloc_block_size_log2;
        let mut node = NodeRef::ROOT;

        loop {
            match self.tree.state(node.index) {
                NodeState::Free => return true,
                NodeState::Allocated => return false,
                NodeState::Split => {
                    if node.level == region_level {
                        return false;
                    }

                    node = self.geometry.child_toward(node, offset);
                }
            }
        }
    }
}

#[cfg(test)]
impl<P: BackingProvider, A: BackingAllocator> Heap<P, A> {
    /// Verifies the structural tree invariant after a sequence of
    /// operations: a split node has at least one live child, and a free
    /// node's materialized subtree is entirely free.
    ///
    /// Checking direct children at every node covers the whole subtree
    /// transitively.
    pub(crate) fn assert_tree_consistent(&self) {
        let first_leaf = self.geometry.num_nodes / 2;

        for index in 0..self.geometry.num_nodes {
            match self.tree.state(index) {
                NodeState::Allocated => {}
                NodeState::Split => {
                    assert!(index < first_leaf, "leaf node {index} is split");

                    let left = self.tree.state(2 * index + 1);
                    let right = self.tree.state(2 * index + 2);
                    assert!(
                        left != NodeState::Free || right != NodeState::Free,
                        "split node {index} has two free children and was not coalesced"
                    );
                }
                NodeState::Free => {
                    if index < first_leaf {
                        assert_eq!(
                            self.tree.state(2 * index + 1),
                            NodeState::Free,
                            "free node {index} has a live left child"
                        );
                        assert_eq!(
                            self.tree.state(2 * index + 2),
                            NodeState::Free,
                            "free node {index} has a live right child"
                        );
                    }
                }
            }
        }
    }
}

impl<P: BackingProvider, A: BackingAllocator> Drop for Heap<P, A> {
    fn drop(&mut self) {
        // Committed backing must not outlive the heap that requested it.
        if !P::LINEAR {
            for region in 0..self.geometry.num_regions {
                if !self.committed.get(region) {
                    continue;
                }

                let region_offset = region << self.geometry.alloc_block_size_log2;
                self.provider
                    .unmap(region_offset, self.geometry.alloc_block_size);
                self.committed.set(region, false);
            }
        }

        let region_layout = self.geometry.region_layout();
        let (metadata_layout, _) = metadata_parts(&self.geometry);

        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), region_layout);
            self.backing_allocator.deallocate(self.metadata, metadata_layout);
        }
    }
}

impl<P: BackingProvider, A: BackingAllocator> fmt::Debug for Heap<P, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base)
            .field("geometry", &self.geometry)
            .field("bytes_allocated", &self.bytes_allocated)
            .finish_non_exhaustive()
    }
}
