//! The array-encoded metadata tree.
//!
//! One node per power-of-two block at every level of the heap, addressed by
//! index arithmetic instead of links: the root is index 0 and the children
//! of node `i` are `2i + 1` and `2i + 2`. A `Free` node's entire subtree is
//! implicitly free without being materialized, so the tree never needs more
//! than `2 * (size / min_block_size) - 1` node slots.

use core::alloc::Layout;

/// The state of one metadata node.
///
/// `Free` is the all-zeroes state so that zero-initialized metadata storage
/// describes a fully free heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    /// Available for allocation at this exact level.
    Free = 0,
    /// Has two live children at the next level down; carries no allocation
    /// itself.
    Split = 1,
    /// A block in active use, at this node's granularity.
    Allocated = 2,
}

/// A coordinate in the metadata tree: a level and an absolute node index.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NodeRef {
    pub level: u32,
    pub index: usize,
}

impl NodeRef {
    pub const ROOT: NodeRef = NodeRef { level: 0, index: 0 };

    /// Returns the child covering the lower-address half of this block.
    #[inline]
    pub fn left_child(self) -> NodeRef {
        NodeRef {
            level: self.level + 1,
            index: 2 * self.index + 1,
        }
    }

    /// Returns the child covering the higher-address half of this block.
    #[inline]
    pub fn right_child(self) -> NodeRef {
        NodeRef {
            level: self.level + 1,
            index: 2 * self.index + 2,
        }
    }

    /// Returns this node's parent and buddy, or `None` for the root.
    ///
    /// The buddy is the sibling that, together with this block, composes the
    /// parent block.
    #[inline]
    pub fn parent_and_buddy(self) -> Option<(NodeRef, NodeRef)> {
        if self.index == 0 {
            return None;
        }

        let parent = NodeRef {
            level: self.level - 1,
            index: (self.index - 1) / 2,
        };

        // Left children have odd indices; the buddy of an odd index is the
        // next even one and vice versa.
        let buddy_index = if self.index % 2 == 1 {
            self.index + 1
        } else {
            self.index - 1
        };

        Some((
            parent,
            NodeRef {
                level: self.level,
                index: buddy_index,
            },
        ))
    }
}

/// A view of the node-state array inside a heap's metadata region.
///
/// Like the committed-region bitmap, this does not own its storage; the heap
/// allocates one metadata region at creation time and carves both views out
/// of it.
#[derive(Debug)]
pub struct Tree {
    num_nodes: usize,
    nodes: *mut u8,
}

impl Tree {
    /// Returns the layout of the storage backing a tree of `num_nodes`
    /// nodes.
    pub fn nodes_layout(num_nodes: usize) -> Layout {
        Layout::array::<u8>(num_nodes).expect("tree metadata layout error")
    }

    /// Constructs a tree of `num_nodes` nodes backed by `nodes`, marking
    /// every node `Free`.
    ///
    /// # Safety
    ///
    /// `nodes` must be valid for reads and writes for `num_nodes` bytes for
    /// the lifetime of the tree, and must not be aliased while the tree
    /// exists.
    pub unsafe fn new(num_nodes: usize, nodes: *mut u8) -> Tree {
        assert!(num_nodes > 0);
        assert!(!nodes.is_null());

        for i in 0..num_nodes {
            unsafe { nodes.add(i).write(NodeState::Free as u8) };
        }

        Tree { num_nodes, nodes }
    }

    /// Gets the state of the indexed node.
    #[inline]
    pub fn state(&self, index: usize) -> NodeState {
        assert!(index < self.num_nodes);

        match unsafe { self.nodes.add(index).read() } {
            0 => NodeState::Free,
            1 => NodeState::Split,
            2 => NodeState::Allocated,
            raw => panic!("metadata node {index} is corrupted (raw state {raw})"),
        }
    }

    /// Sets the state of the indexed node.
    #[inline]
    pub fn set_state(&mut self, index: usize, state: NodeState) {
        assert!(index < self.num_nodes);

        unsafe { self.nodes.add(index).write(state as u8) };
    }
}
