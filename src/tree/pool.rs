// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The node pool: page-sized nodes inside a `VmVector`, addressed by slot.
//!
//! Node accessors (`NodeRef`, `LeafRef`, `InnerRef`) are raw-pointer views
//! into the pool's mapping. The single-owner contract of the tree makes the
//! discipline simple: a ref is valid until the next call that may grow the
//! pool (`allocate_node`, `reserve_*`), and no ref is held across one.
//! Slots stay valid across relocations; refs are re-fetched from slots.

use super::node::{InnerLayout, LeafLayout, NodeHeader, NodeSlot, RawNode, NODE_SIZE};
use crate::mapping::{AccessMode, OpenPolicy};
use crate::vector::{GrowthPolicy, VmVector};
use crate::Result;
use byteorder::{ByteOrder, LittleEndian};
use bytemuck::Pod;
use std::marker::PhantomData;
use std::path::Path;
use std::ptr::NonNull;

// Persisted pool header, little-endian, inside the vector's user header:
const HDR_ROOT: usize = 0;
const HDR_FIRST_LEAF: usize = 4;
const HDR_LAST_LEAF: usize = 8;
const HDR_FREE_LIST: usize = 12;
const HDR_FREE_COUNT: usize = 16;
const HDR_DEPTH: usize = 20;
const HDR_VALUE_COUNT: usize = 24;

/// Header-typed view of a node.
#[derive(Clone, Copy)]
pub(crate) struct NodeRef {
    ptr: NonNull<u8>,
}

impl NodeRef {
    pub fn hdr(self) -> NodeHeader {
        // SAFETY: every pool page starts with a NodeHeader
        unsafe { self.ptr.cast::<NodeHeader>().as_ptr().read() }
    }

    pub fn set_hdr(self, hdr: NodeHeader) {
        // SAFETY: as above; the tree owns the pool exclusively
        unsafe { self.ptr.cast::<NodeHeader>().as_ptr().write(hdr) }
    }

    pub fn parent(self) -> NodeSlot {
        self.hdr().parent
    }

    pub fn left(self) -> NodeSlot {
        self.hdr().left
    }

    pub fn right(self) -> NodeSlot {
        self.hdr().right
    }

    pub fn num_vals(self) -> usize {
        usize::from(self.hdr().num_vals)
    }

    pub fn parent_child_idx(self) -> usize {
        usize::from(self.hdr().parent_child_idx)
    }

    pub fn is_root(self) -> bool {
        self.parent().is_null()
    }

    pub fn set_parent(self, slot: NodeSlot) {
        let mut hdr = self.hdr();
        hdr.parent = slot;
        self.set_hdr(hdr);
    }

    pub fn set_left(self, slot: NodeSlot) {
        let mut hdr = self.hdr();
        hdr.left = slot;
        self.set_hdr(hdr);
    }

    pub fn set_right(self, slot: NodeSlot) {
        let mut hdr = self.hdr();
        hdr.right = slot;
        self.set_hdr(hdr);
    }

    pub fn set_num_vals(self, n: usize) {
        debug_assert!(n <= u16::MAX as usize);
        let mut hdr = self.hdr();
        hdr.num_vals = n as u16;
        self.set_hdr(hdr);
    }

    pub fn set_parent_child_idx(self, idx: usize) {
        debug_assert!(idx <= u16::MAX as usize);
        let mut hdr = self.hdr();
        hdr.parent_child_idx = idx as u16;
        self.set_hdr(hdr);
    }

    pub fn set_parent_link(self, parent: NodeSlot, idx: usize) {
        let mut hdr = self.hdr();
        hdr.parent = parent;
        hdr.parent_child_idx = idx as u16;
        self.set_hdr(hdr);
    }
}

/// Typed view of a leaf page.
pub(crate) struct LeafRef<K> {
    node: NodeRef,
    _marker: PhantomData<K>,
}

impl<K> Clone for LeafRef<K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K> Copy for LeafRef<K> {}

impl<K: Pod> LeafRef<K> {
    pub const MAX: usize = LeafLayout::<K>::MAX_KEYS;

    pub fn node(self) -> NodeRef {
        self.node
    }

    fn keys_ptr(self) -> *mut K {
        // SAFETY: KEYS_OFFSET < NODE_SIZE; the page is ours
        unsafe { self.node.ptr.as_ptr().add(LeafLayout::<K>::KEYS_OFFSET).cast() }
    }

    pub fn key(self, i: usize) -> K {
        debug_assert!(i < self.node.num_vals());
        // SAFETY: i is within the live prefix of the keys array
        unsafe { self.keys_ptr().add(i).read() }
    }

    pub fn set_key(self, i: usize, key: K) {
        debug_assert!(i < Self::MAX);
        // SAFETY: i is within the keys array
        unsafe { self.keys_ptr().add(i).write(key) }
    }

    /// The live keys. Valid until the pool grows or this leaf is mutated.
    pub fn keys<'a>(self) -> &'a [K] {
        let n = self.node.num_vals();
        debug_assert!(n <= Self::MAX);
        // SAFETY: the live prefix is initialised; see module discipline
        unsafe { std::slice::from_raw_parts(self.keys_ptr(), n) }
    }

    /// Shifts `keys[from..end)` one slot to the right.
    pub fn rshift_keys(self, from: usize, end: usize) {
        debug_assert!(from <= end && end < Self::MAX);
        // SAFETY: overlapping copy within the keys array
        unsafe {
            std::ptr::copy(self.keys_ptr().add(from), self.keys_ptr().add(from + 1), end - from);
        }
    }

    /// Shifts `keys[from..end)` one slot to the left, erasing
    /// `keys[from - 1]`.
    pub fn lshift_keys(self, from: usize, end: usize) {
        debug_assert!(from > 0 && from <= end && end <= Self::MAX);
        // SAFETY: overlapping copy within the keys array
        unsafe {
            std::ptr::copy(self.keys_ptr().add(from), self.keys_ptr().add(from - 1), end - from);
        }
    }

    /// Copies `count` keys from `src[src_from..]` to `self[dst_from..]`.
    /// The nodes must be distinct.
    pub fn copy_keys_from(self, src: LeafRef<K>, src_from: usize, dst_from: usize, count: usize) {
        debug_assert!(src_from + count <= Self::MAX);
        debug_assert!(dst_from + count <= Self::MAX);
        // SAFETY: distinct nodes, ranges within their key arrays
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.keys_ptr().add(src_from),
                self.keys_ptr().add(dst_from),
                count,
            );
        }
    }

    /// Copies a caller-provided run into `self[dst_from..]`.
    pub fn write_keys(self, dst_from: usize, run: &[K]) {
        debug_assert!(dst_from + run.len() <= Self::MAX);
        // SAFETY: the range lies within the keys array
        unsafe {
            std::ptr::copy_nonoverlapping(run.as_ptr(), self.keys_ptr().add(dst_from), run.len());
        }
    }

    /// Moves `keys[from..end)` to start at index `to` (overlap allowed).
    pub fn move_keys_within(self, from: usize, end: usize, to: usize) {
        debug_assert!(from <= end && end <= Self::MAX);
        debug_assert!(to + (end - from) <= Self::MAX);
        // SAFETY: both ranges lie within the keys array
        unsafe {
            std::ptr::copy(self.keys_ptr().add(from), self.keys_ptr().add(to), end - from);
        }
    }

    /// Moves own keys `[from..num_vals)` down to index 0 (bulk consume).
    pub fn drop_key_prefix(self, from: usize) {
        let n = self.node.num_vals();
        debug_assert!(from <= n);
        // SAFETY: overlapping copy within the keys array
        unsafe {
            std::ptr::copy(self.keys_ptr().add(from), self.keys_ptr(), n - from);
        }
        self.node.set_num_vals(n - from);
    }
}

/// Typed view of an inner page.
pub(crate) struct InnerRef<K> {
    node: NodeRef,
    _marker: PhantomData<K>,
}

impl<K> Clone for InnerRef<K> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<K> Copy for InnerRef<K> {}

impl<K: Pod> InnerRef<K> {
    pub const MAX: usize = InnerLayout::<K>::MAX_KEYS;

    pub fn node(self) -> NodeRef {
        self.node
    }

    pub fn num_children(self) -> usize {
        debug_assert!(self.node.num_vals() > 0);
        self.node.num_vals() + 1
    }

    fn keys_ptr(self) -> *mut K {
        // SAFETY: KEYS_OFFSET < NODE_SIZE; the page is ours
        unsafe { self.node.ptr.as_ptr().add(InnerLayout::<K>::KEYS_OFFSET).cast() }
    }

    fn children_ptr(self) -> *mut NodeSlot {
        // SAFETY: CHILDREN_OFFSET < NODE_SIZE; the page is ours
        unsafe {
            self.node
                .ptr
                .as_ptr()
                .add(InnerLayout::<K>::CHILDREN_OFFSET)
                .cast()
        }
    }

    pub fn key(self, i: usize) -> K {
        debug_assert!(i < self.node.num_vals());
        // SAFETY: i is within the live prefix
        unsafe { self.keys_ptr().add(i).read() }
    }

    pub fn set_key(self, i: usize, key: K) {
        debug_assert!(i < Self::MAX);
        // SAFETY: i is within the keys array
        unsafe { self.keys_ptr().add(i).write(key) }
    }

    pub fn keys<'a>(self) -> &'a [K] {
        let n = self.node.num_vals();
        debug_assert!(n <= Self::MAX);
        // SAFETY: the live prefix is initialised; see module discipline
        unsafe { std::slice::from_raw_parts(self.keys_ptr(), n) }
    }

    pub fn child(self, i: usize) -> NodeSlot {
        debug_assert!(i < self.num_children());
        // SAFETY: i is within the live children prefix
        unsafe { self.children_ptr().add(i).read() }
    }

    pub fn set_child_raw(self, i: usize, child: NodeSlot) {
        debug_assert!(i < InnerLayout::<K>::ORDER);
        // SAFETY: i is within the children array
        unsafe { self.children_ptr().add(i).write(child) }
    }

    pub fn rshift_keys(self, from: usize, end: usize) {
        debug_assert!(from <= end && end < Self::MAX);
        // SAFETY: overlapping copy within the keys array
        unsafe {
            std::ptr::copy(self.keys_ptr().add(from), self.keys_ptr().add(from + 1), end - from);
        }
    }

    pub fn lshift_keys(self, from: usize, end: usize) {
        debug_assert!(from > 0 && from <= end && end <= Self::MAX);
        // SAFETY: overlapping copy within the keys array
        unsafe {
            std::ptr::copy(self.keys_ptr().add(from), self.keys_ptr().add(from - 1), end - from);
        }
    }

    fn rshift_children_raw(self, from: usize, end: usize) {
        debug_assert!(from <= end && end < InnerLayout::<K>::ORDER);
        // SAFETY: overlapping copy within the children array
        unsafe {
            std::ptr::copy(
                self.children_ptr().add(from),
                self.children_ptr().add(from + 1),
                end - from,
            );
        }
    }

    fn lshift_children_raw(self, from: usize, end: usize) {
        debug_assert!(from > 0 && from <= end);
        // SAFETY: overlapping copy within the children array
        unsafe {
            std::ptr::copy(
                self.children_ptr().add(from),
                self.children_ptr().add(from - 1),
                end - from,
            );
        }
    }
}

/// Fixed-size nodes in a growable mapped vector, plus the persisted tree
/// header in the vector's user header area.
pub(crate) struct NodePool<K: Pod> {
    nodes: VmVector<RawNode>,
    _marker: PhantomData<K>,
}

impl<K: Pod> NodePool<K> {
    pub const fn detached() -> Self {
        Self {
            nodes: VmVector::new(),
            _marker: PhantomData,
        }
    }

    pub fn map_memory(initial_nodes: usize) -> Result<Self> {
        let nodes = VmVector::map_memory(initial_nodes)?;
        let mut pool = Self {
            nodes,
            _marker: PhantomData,
        };
        pool.init_header();
        Ok(pool)
    }

    pub fn open(path: &Path, policy: OpenPolicy, access: AccessMode) -> Result<Self> {
        let nodes = VmVector::open_with_access(path, policy, access)?;
        let mut pool = Self {
            nodes,
            _marker: PhantomData,
        };
        if pool.nodes.is_empty() && !pool.nodes.is_read_only() {
            pool.init_header();
        }
        Ok(pool)
    }

    pub fn has_attached_storage(&self) -> bool {
        self.nodes.has_attached_storage()
    }

    pub fn is_read_only(&self) -> bool {
        self.nodes.is_read_only()
    }

    pub fn flush_async(&self) -> Result<()> {
        self.nodes.flush_async()
    }

    pub fn flush_blocking(&self) -> Result<()> {
        self.nodes.flush_blocking()
    }

    pub fn swap(&mut self, other: &mut Self) {
        self.nodes.swap(&mut other.nodes);
    }

    pub fn init_header(&mut self) {
        self.set_root(NodeSlot::NULL);
        self.set_first_leaf(NodeSlot::NULL);
        self.set_last_leaf(NodeSlot::NULL);
        self.set_free_list(NodeSlot::NULL);
        self.set_free_count(0);
        self.set_depth(0);
        self.set_value_count(0);
    }

    fn read_slot(&self, offset: usize) -> NodeSlot {
        NodeSlot::new(LittleEndian::read_u32(&self.nodes.user_header()[offset..offset + 4]))
    }

    fn write_slot(&mut self, offset: usize, slot: NodeSlot) {
        let raw: u32 = bytemuck::cast(slot);
        LittleEndian::write_u32(&mut self.nodes.user_header_mut()[offset..offset + 4], raw);
    }

    pub fn root(&self) -> NodeSlot {
        self.read_slot(HDR_ROOT)
    }

    pub fn set_root(&mut self, slot: NodeSlot) {
        self.write_slot(HDR_ROOT, slot);
    }

    pub fn first_leaf(&self) -> NodeSlot {
        self.read_slot(HDR_FIRST_LEAF)
    }

    pub fn set_first_leaf(&mut self, slot: NodeSlot) {
        self.write_slot(HDR_FIRST_LEAF, slot);
    }

    pub fn last_leaf(&self) -> NodeSlot {
        self.read_slot(HDR_LAST_LEAF)
    }

    pub fn set_last_leaf(&mut self, slot: NodeSlot) {
        self.write_slot(HDR_LAST_LEAF, slot);
    }

    pub fn free_list(&self) -> NodeSlot {
        self.read_slot(HDR_FREE_LIST)
    }

    pub fn set_free_list(&mut self, slot: NodeSlot) {
        self.write_slot(HDR_FREE_LIST, slot);
    }

    pub fn free_count(&self) -> u32 {
        LittleEndian::read_u32(&self.nodes.user_header()[HDR_FREE_COUNT..HDR_FREE_COUNT + 4])
    }

    pub fn set_free_count(&mut self, count: u32) {
        LittleEndian::write_u32(
            &mut self.nodes.user_header_mut()[HDR_FREE_COUNT..HDR_FREE_COUNT + 4],
            count,
        );
    }

    pub fn depth(&self) -> u32 {
        LittleEndian::read_u32(&self.nodes.user_header()[HDR_DEPTH..HDR_DEPTH + 4])
    }

    pub fn set_depth(&mut self, depth: u32) {
        LittleEndian::write_u32(&mut self.nodes.user_header_mut()[HDR_DEPTH..HDR_DEPTH + 4], depth);
    }

    pub fn value_count(&self) -> u64 {
        LittleEndian::read_u64(&self.nodes.user_header()[HDR_VALUE_COUNT..HDR_VALUE_COUNT + 8])
    }

    pub fn set_value_count(&mut self, count: u64) {
        LittleEndian::write_u64(
            &mut self.nodes.user_header_mut()[HDR_VALUE_COUNT..HDR_VALUE_COUNT + 8],
            count,
        );
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_capacity(&self) -> usize {
        self.nodes.capacity()
    }

    fn node_ptr(&self, slot: NodeSlot) -> NonNull<u8> {
        debug_assert!(slot.index() < self.nodes.len());
        // SAFETY: slot bounds just checked; data() is non-null while mapped
        unsafe { NonNull::new_unchecked(self.nodes.data().add(slot.index() * NODE_SIZE)) }
    }

    pub fn node(&self, slot: NodeSlot) -> NodeRef {
        NodeRef {
            ptr: self.node_ptr(slot),
        }
    }

    pub fn leaf(&self, slot: NodeSlot) -> LeafRef<K> {
        LeafRef {
            node: self.node(slot),
            _marker: PhantomData,
        }
    }

    pub fn inner(&self, slot: NodeSlot) -> InnerRef<K> {
        InnerRef {
            node: self.node(slot),
            _marker: PhantomData,
        }
    }

    /// Pops the free list, or appends a fresh node. May relocate the pool;
    /// refs held across this call are invalid.
    pub fn allocate_node(&mut self) -> Result<NodeSlot> {
        let head = self.free_list();
        if !head.is_null() {
            let node = self.node(head);
            let next = node.right();
            node.set_hdr(NodeHeader::EMPTY);
            self.set_free_list(next);
            self.set_free_count(self.free_count() - 1);
            return Ok(head);
        }

        let index = self.nodes.len();
        debug_assert!(index < u32::MAX as usize);
        self.nodes.grow_by(1, GrowthPolicy::NoInit)?;
        let slot = NodeSlot::new(index as u32);
        self.node(slot).set_hdr(NodeHeader::EMPTY);
        Ok(slot)
    }

    /// Clears the node's linkage and pushes it onto the free list.
    pub fn free_node(&mut self, slot: NodeSlot) {
        let mut hdr = NodeHeader::EMPTY;
        hdr.right = self.free_list();
        self.node(slot).set_hdr(hdr);
        self.set_free_list(slot);
        self.set_free_count(self.free_count() + 1);
    }

    /// Ensures room for `additional` more nodes without further OS calls.
    pub fn reserve_nodes(&mut self, additional: usize) -> Result<()> {
        let from_free_list = self.free_count() as usize;
        self.nodes.reserve(additional.saturating_sub(from_free_list))
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.init_header();
    }

    /// Inserts `child` at `parent.children[pos]` and fixes the child's
    /// back-link. `parent_slot` must be `parent`'s own slot.
    pub fn set_child(
        &self,
        parent: InnerRef<K>,
        pos: usize,
        child: NodeSlot,
        parent_slot: NodeSlot,
    ) {
        parent.set_child_raw(pos, child);
        self.node(child).set_parent_link(parent_slot, pos);
    }

    /// Shifts `parent.children[from..end)` right by one, maintaining each
    /// moved child's `parent_child_idx`.
    pub fn rshift_children(&self, parent: InnerRef<K>, from: usize, end: usize) {
        parent.rshift_children_raw(from, end);
        for i in from + 1..=end {
            self.node(parent.child_raw_for_move(i)).set_parent_child_idx(i);
        }
    }

    /// Shifts `parent.children[from..end)` left by one, maintaining each
    /// moved child's `parent_child_idx`.
    pub fn lshift_children(&self, parent: InnerRef<K>, from: usize, end: usize) {
        parent.lshift_children_raw(from, end);
        for i in from - 1..end - 1 {
            self.node(parent.child_raw_for_move(i)).set_parent_child_idx(i);
        }
    }

    /// Moves `count` children from `src[src_from..]` to
    /// `dst[dst_from..]`, re-parenting each moved child.
    pub fn move_children(
        &self,
        src: InnerRef<K>,
        src_from: usize,
        dst: InnerRef<K>,
        dst_slot: NodeSlot,
        dst_from: usize,
        count: usize,
    ) {
        for i in 0..count {
            let child = src.child_raw_for_move(src_from + i);
            dst.set_child_raw(dst_from + i, child);
            self.node(child).set_parent_link(dst_slot, dst_from + i);
        }
    }
}

impl<K: Pod> InnerRef<K> {
    // reads beyond num_children during splits, where the source count has
    // already been cut down
    fn child_raw_for_move(self, i: usize) -> NodeSlot {
        debug_assert!(i < InnerLayout::<K>::ORDER);
        // SAFETY: i is within the children array
        unsafe { self.children_ptr().add(i).read() }
    }
}
