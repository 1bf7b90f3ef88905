//! Heap geometry: creation-time validation and precomputed index math.
//!
//! Everything the hot paths need (target levels, node indices, block
//! offsets, spanned backing regions) reduces to shifts against constants
//! computed once here, so no logarithm or division runs inside `allocate`
//! or `deallocate`.

use core::alloc::Layout;
use core::ops::Range;

use crate::{stack::MAX_TRAVERSAL_DEPTH, tree::NodeRef, HeapInitError};

/// Validated, precomputed constants for one heap instance.
///
/// Level 0 is the whole heap; the deepest level has blocks of
/// `min_block_size`. The metadata tree for `levels` levels holds
/// `2^levels - 1` nodes.
#[derive(Copy, Clone, Debug)]
pub struct Geometry {
    pub size: usize,
    pub min_block_size: usize,
    pub alloc_block_size: usize,
    pub size_log2: u32,
    pub min_block_size_log2: u32,
    pub alloc_block_size_log2: u32,
    /// Number of tree levels, `size_log2 - min_block_size_log2 + 1`.
    pub levels: u32,
    /// Total node slots in the metadata tree, `2 * (size / min_block_size) - 1`.
    pub num_nodes: usize,
    /// Number of `alloc_block_size`-aligned backing regions in the heap.
    pub num_regions: usize,
}

impl Geometry {
    /// Validates a heap configuration and precomputes its constants.
    ///
    /// `size`, `min_block_size` and `alloc_block_size` must all be powers of
    /// two with `min_block_size <= alloc_block_size <= size`, and the
    /// resulting tree depth must fit the fixed traversal stack.
    pub fn new(
        size: usize,
        min_block_size: usize,
        alloc_block_size: usize,
    ) -> Result<Geometry, HeapInitError> {
        if !size.is_power_of_two()
            || !min_block_size.is_power_of_two()
            || !alloc_block_size.is_power_of_two()
        {
            return Err(HeapInitError::InvalidConfig);
        }

        if min_block_size > alloc_block_size || alloc_block_size > size {
            return Err(HeapInitError::InvalidConfig);
        }

        let size_log2 = size.ilog2();
        let min_block_size_log2 = min_block_size.ilog2();
        let alloc_block_size_log2 = alloc_block_size.ilog2();

        let levels = size_log2 - min_block_size_log2 + 1;
        if levels as usize > MAX_TRAVERSAL_DEPTH {
            return Err(HeapInitError::InvalidConfig);
        }

        Ok(Geometry {
            size,
            min_block_size,
            alloc_block_size,
            size_log2,
            min_block_size_log2,
            alloc_block_size_log2,
            levels,
            num_nodes: (1 << levels) - 1,
            num_regions: size >> alloc_block_size_log2,
        })
    }

    /// Validates the base address of the region this geometry will manage.
    ///
    /// The base must be aligned to the heap size so that every block is
    /// aligned to its own size in absolute terms, and the region must not
    /// wrap the address space.
    pub fn check_base(&self, base_addr: usize) -> Result<(), HeapInitError> {
        if base_addr == 0 || base_addr & (self.size - 1) != 0 {
            return Err(HeapInitError::InvalidConfig);
        }

        base_addr
            .checked_add(self.size)
            .map(|_| ())
            .ok_or(HeapInitError::InvalidConfig)
    }

    /// Returns the tree level that serves an allocation of `alloc_size`
    /// bytes.
    ///
    /// The request is rounded up to the nearest power of two no smaller than
    /// `min_block_size`. `alloc_size` must already be in `1..=size`.
    #[inline]
    pub fn level_for(&self, alloc_size: usize) -> u32 {
        debug_assert!(alloc_size > 0 && alloc_size <= self.size);

        let block_size = alloc_size.next_power_of_two().max(self.min_block_size);
        self.size_log2 - block_size.ilog2()
    }

    /// Returns the block size served at `level`.
    #[inline]
    pub fn block_size(&self, level: u32) -> usize {
        self.size >> level
    }

    /// Returns the node covering the block of `level`'s size that starts
    /// `offset` bytes into the heap.
    #[inline]
    pub fn node_at(&self, level: u32, offset: usize) -> NodeRef {
        debug_assert!(level < self.levels);
        debug_assert!(offset < self.size);

        NodeRef {
            level,
            index: ((1 << level) - 1) + (offset >> (self.size_log2 - level)),
        }
    }

    /// Returns the offset into the heap of the block covered by `node`.
    #[inline]
    pub fn node_offset(&self, node: NodeRef) -> usize {
        (node.index - ((1 << node.level) - 1)) << (self.size_log2 - node.level)
    }

    /// Returns the child of `node` whose block covers `offset`.
    #[inline]
    pub fn child_toward(&self, node: NodeRef, offset: usize) -> NodeRef {
        let child_level = node.level + 1;
        debug_assert!(child_level < self.levels);

        if (offset >> (self.size_log2 - child_level)) & 1 == 0 {
            node.left_child()
        } else {
            node.right_child()
        }
    }

    /// Returns the tree level whose block size equals `alloc_block_size`.
    #[inline]
    pub fn region_level(&self) -> u32 {
        self.size_log2 - self.alloc_block_size_log2
    }

    /// Returns the range of backing-region indices spanned by the block of
    /// `len` bytes at `offset`.
    #[inline]
    pub fn regions_spanned(&self, offset: usize, len: usize) -> Range<usize> {
        debug_assert!(len > 0 && offset + len <= self.size);

        let first = offset >> self.alloc_block_size_log2;
        let last = (offset + len - 1) >> self.alloc_block_size_log2;
        first..last + 1
    }

    /// Returns the layout of the virtual region for this geometry.
    ///
    /// The alignment equals the heap size; see [`Geometry::check_base`].
    pub fn region_layout(&self) -> Layout {
        Layout::from_size_align(self.size, self.size).expect("validated region layout")
    }
}
