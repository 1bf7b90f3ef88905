//! The explicit traversal stack.
//!
//! Kernel code runs on a small fixed stack, so tree walks must not recurse.
//! Descents are driven by this bounded LIFO of tree coordinates instead; it
//! lives on the native stack for the duration of a single `allocate` call
//! and is never persisted.

use arrayvec::ArrayVec;

use crate::tree::NodeRef;

/// Upper bound on the number of tree levels, and therefore on traversal
/// depth.
///
/// Heap creation validates `log2(size / min_block_size) + 1` against this
/// bound, which caps the heap-to-minimum-block ratio at `2^31`.
pub const MAX_TRAVERSAL_DEPTH: usize = 32;

/// A fixed-capacity LIFO of tree coordinates.
///
/// A descent holds at most one pending sibling per level plus the node in
/// hand, so the validated level count bounds its occupancy.
#[derive(Debug)]
pub struct TraversalStack {
    frames: ArrayVec<NodeRef, MAX_TRAVERSAL_DEPTH>,
}

impl TraversalStack {
    pub fn new() -> TraversalStack {
        TraversalStack {
            frames: ArrayVec::new(),
        }
    }

    /// Pushes a node to visit.
    ///
    /// Overflow is unreachable for a heap that passed geometry validation;
    /// hitting it means the metadata no longer matches the validated
    /// geometry, so it aborts rather than truncating the walk.
    #[inline]
    pub fn push(&mut self, node: NodeRef) {
        if self.frames.try_push(node).is_err() {
            panic!("traversal stack overflow: heap metadata is corrupted");
        }
    }

    /// Pops the most recently pushed node.
    #[inline]
    pub fn pop(&mut self) -> Option<NodeRef> {
        self.frames.pop()
    }
}
