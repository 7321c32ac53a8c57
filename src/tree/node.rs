// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use bytemuck::{Pod, Zeroable};
use std::marker::PhantomData;

/// Nodes are fixed to one page; the pool is a `VmVector<RawNode>`.
pub(crate) const NODE_SIZE: usize = 4096;

/// Index of a node in the pool. Slots, not pointers: the pool may be
/// relocated wholesale and the on-disk image stays position-independent.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct NodeSlot(u32);

// SAFETY: a plain u32 wrapper, any bit pattern is a valid slot value
unsafe impl Zeroable for NodeSlot {}
unsafe impl Pod for NodeSlot {}

impl NodeSlot {
    /// The reserved "none" value.
    pub(crate) const NULL: Self = Self(u32::MAX);

    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    pub(crate) const fn is_null(self) -> bool {
        self.0 == u32::MAX
    }

    pub(crate) fn index(self) -> usize {
        debug_assert!(!self.is_null());
        self.0 as usize
    }
}

impl std::fmt::Debug for NodeSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "slot(-)")
        } else {
            write!(f, "slot({})", self.0)
        }
    }
}

/// The common 16-byte prefix of every node.
///
/// `parent_child_idx` pinpoints the node inside its parent's children
/// array, which makes every structural update O(1) on the parent side.
/// For a node on the free list, `right` doubles as the "next free" link.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub(crate) struct NodeHeader {
    pub parent: NodeSlot,
    pub left: NodeSlot,
    pub right: NodeSlot,
    pub num_vals: u16,
    pub parent_child_idx: u16,
}

// SAFETY: repr(C), 16 bytes, no padding, all fields are Pod
unsafe impl Zeroable for NodeHeader {}
unsafe impl Pod for NodeHeader {}

impl NodeHeader {
    pub(crate) const EMPTY: Self = Self {
        parent: NodeSlot::NULL,
        left: NodeSlot::NULL,
        right: NodeSlot::NULL,
        num_vals: 0,
        parent_child_idx: 0,
    };
}

pub(crate) const HEADER_BYTES: usize = std::mem::size_of::<NodeHeader>();

/// One page-sized pool element.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct RawNode(pub [u8; NODE_SIZE]);

// SAFETY: a byte array has no invalid values and no padding
unsafe impl Zeroable for RawNode {}
unsafe impl Pod for RawNode {}

pub(crate) const fn align_up_const(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Byte layout of a leaf page: header, alignment gap, then up to
/// `MAX_KEYS` sorted values.
pub(crate) struct LeafLayout<K>(PhantomData<K>);

impl<K: Pod> LeafLayout<K> {
    pub(crate) const KEYS_OFFSET: usize =
        align_up_const(HEADER_BYTES, std::mem::align_of::<K>());

    pub(crate) const MAX_KEYS: usize =
        (NODE_SIZE - Self::KEYS_OFFSET) / std::mem::size_of::<K>();

    // ceil(max / 2)
    pub(crate) const MIN_KEYS: usize = Self::MAX_KEYS.div_ceil(2);
}

/// The largest fan-out `m` such that header + `m` child slots + `m - 1`
/// keys (with their alignment gap) still fit in one page.
const fn inner_order(key_size: usize, key_align: usize) -> usize {
    // closed-form estimate, then walk down for the alignment gap
    let mut order = (NODE_SIZE - HEADER_BYTES + key_size) / (key_size + 4);
    loop {
        let keys_offset = align_up_const(HEADER_BYTES + 4 * order, key_align);
        if keys_offset + (order - 1) * key_size <= NODE_SIZE {
            return order;
        }
        order -= 1;
    }
}

/// Byte layout of an inner page: header, `ORDER` child slots, alignment
/// gap, then up to `ORDER - 1` separator keys.
pub(crate) struct InnerLayout<K>(PhantomData<K>);

impl<K: Pod> InnerLayout<K> {
    pub(crate) const ORDER: usize =
        inner_order(std::mem::size_of::<K>(), std::mem::align_of::<K>());

    pub(crate) const MAX_KEYS: usize = Self::ORDER - 1;

    pub(crate) const MIN_CHILDREN: usize = Self::ORDER.div_ceil(2);

    pub(crate) const MIN_KEYS: usize = Self::MIN_CHILDREN - 1;

    pub(crate) const CHILDREN_OFFSET: usize = HEADER_BYTES;

    pub(crate) const KEYS_OFFSET: usize =
        align_up_const(HEADER_BYTES + 4 * Self::ORDER, std::mem::align_of::<K>());
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn header_is_sixteen_bytes() {
        assert_eq!(HEADER_BYTES, 16);
        assert_eq!(std::mem::size_of::<RawNode>(), NODE_SIZE);
    }

    #[test]
    fn leaf_layout_fills_the_page() {
        assert_eq!(LeafLayout::<u32>::KEYS_OFFSET, 16);
        assert_eq!(LeafLayout::<u32>::MAX_KEYS, (4096 - 16) / 4);
        assert_eq!(
            LeafLayout::<u32>::MIN_KEYS,
            (LeafLayout::<u32>::MAX_KEYS + 1) / 2
        );

        // a 16-byte-aligned key forces a gap after the header
        #[derive(Clone, Copy)]
        #[repr(C, align(16))]
        struct Wide([u8; 32]);
        unsafe impl Zeroable for Wide {}
        unsafe impl Pod for Wide {}

        assert_eq!(LeafLayout::<Wide>::KEYS_OFFSET, 16);
        assert_eq!(LeafLayout::<Wide>::MAX_KEYS, (4096 - 16) / 32);
    }

    #[test]
    fn inner_layout_is_consistent() {
        let order = InnerLayout::<u64>::ORDER;
        assert!(order >= 3);
        assert!(
            InnerLayout::<u64>::KEYS_OFFSET + InnerLayout::<u64>::MAX_KEYS * 8 <= NODE_SIZE
        );

        // the next larger order must not fit any more
        let keys_offset = align_up_const(HEADER_BYTES + 4 * (order + 1), 8);
        assert!(keys_offset + order * 8 > NODE_SIZE);
    }

    #[test]
    fn null_slot_sentinel() {
        assert!(NodeSlot::NULL.is_null());
        assert!(!NodeSlot::new(0).is_null());
        assert_eq!(bytemuck::bytes_of(&NodeSlot::NULL), &[0xFF; 4]);
    }
}
