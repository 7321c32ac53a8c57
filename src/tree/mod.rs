// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A B+ tree whose node pool lives inside a [`VmVector`](crate::VmVector)
//! of page-sized nodes.
//!
//! Nodes address each other through compact 32-bit slots, never pointers,
//! so the pool can be relocated wholesale on growth and the on-disk image
//! is position-independent: opening the same backing file restores the
//! tree exactly.

mod bulk;
mod check;
mod iter;
mod node;
mod pool;
mod search;

pub use iter::{Cursor, Iter, RaIter};

use crate::comparator::{Comparator, NaturalOrder};
use crate::mapping::{AccessMode, OpenPolicy};
use crate::{Error, Result};
use bytemuck::Pod;
use node::{InnerLayout, LeafLayout, NodeSlot};
use pool::{InnerRef, LeafRef, NodePool};
use search::{find_in_keys, use_linear_search, FindPos};
use std::path::Path;

/// An ordered, persistent set (or multiset, see `UNIQUE`) of `Pod` keys in
/// a memory-mapped node pool.
///
/// A single instance is owned by a single thread of control; share across
/// threads only with external synchronisation. Durability is explicit:
/// [`flush_blocking`](Self::flush_blocking) or process exit with a clean
/// unmap.
///
/// A map is expressed as a set of `Pod` key-value pairs with a comparator
/// projecting the key part.
pub struct BpTree<K, C = NaturalOrder, const UNIQUE: bool = true>
where
    K: Pod,
    C: Comparator<K>,
{
    pool: NodePool<K>,
    comp: C,
}

/// Unique-key tree.
pub type BpSet<K, C = NaturalOrder> = BpTree<K, C, true>;

/// Tree accepting equivalent duplicates.
pub type BpMultiSet<K, C = NaturalOrder> = BpTree<K, C, false>;

/// Where an insertion ended up: the node and the offset just past the
/// inserted entry.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InsertPos {
    node: NodeSlot,
    next_offset: usize,
}

/// Result of a root-to-leaf descent.
pub(crate) struct KeyLocation {
    leaf: NodeSlot,
    pos: FindPos,
    /// Inner node holding the probe as a separator copy, if any.
    inner: NodeSlot,
    inner_offset: usize,
}

impl<K, C, const UNIQUE: bool> Default for BpTree<K, C, UNIQUE>
where
    K: Pod,
    C: Comparator<K> + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, C, const UNIQUE: bool> BpTree<K, C, UNIQUE>
where
    K: Pod,
    C: Comparator<K>,
{
    /// Values a leaf node can hold, derived from the page layout.
    #[doc(hidden)]
    pub const MAX_LEAF_VALUES: usize = LeafLayout::<K>::MAX_KEYS;

    pub(crate) const LEAF_MAX: usize = LeafLayout::<K>::MAX_KEYS;
    pub(crate) const LEAF_MIN: usize = LeafLayout::<K>::MIN_KEYS;
    pub(crate) const INNER_MAX: usize = InnerLayout::<K>::MAX_KEYS;
    pub(crate) const INNER_MIN: usize = InnerLayout::<K>::MIN_KEYS;

    const LEAF_LINEAR: bool = use_linear_search::<K, C>(LeafLayout::<K>::MAX_KEYS);
    const INNER_LINEAR: bool = use_linear_search::<K, C>(InnerLayout::<K>::MAX_KEYS);

    /// Creates a detached tree with a default comparator. Attach storage
    /// with [`map_memory`](Self::map_memory) or [`map_file`](Self::map_file);
    /// mutating a detached tree attaches anonymous memory on demand.
    #[must_use]
    pub fn new() -> Self
    where
        C: Default,
    {
        Self::with_comparator(C::default())
    }

    /// Creates a detached tree using `comp` for all orderings.
    #[must_use]
    pub fn with_comparator(comp: C) -> Self {
        const {
            assert!(
                InnerLayout::<K>::MIN_CHILDREN >= 3,
                "key type too large for page-sized inner nodes"
            );
            assert!(
                LeafLayout::<K>::MAX_KEYS >= 4,
                "key type too large for page-sized leaves"
            );
            assert!(std::mem::align_of::<K>() <= NODE_ALIGN_LIMIT);
        }

        Self {
            pool: NodePool::detached(),
            comp,
        }
    }

    /// Attaches an anonymous, process-private backing with room for about
    /// `initial_capacity` values.
    pub fn map_memory(&mut self, initial_capacity: usize) -> Result<()> {
        let nodes = Self::node_count_for_values(initial_capacity);
        self.pool = NodePool::map_memory(nodes)?;
        Ok(())
    }

    /// Attaches (or creates) the backing file at `path` per `policy`.
    /// An existing non-empty file restores the persisted tree.
    pub fn map_file(&mut self, path: &Path, policy: OpenPolicy) -> Result<()> {
        self.pool = NodePool::open(path, policy, AccessMode::ReadWrite)?;
        Ok(())
    }

    /// Opens an existing backing file for queries and iteration only.
    pub fn map_file_read_only(&mut self, path: &Path) -> Result<()> {
        self.pool = NodePool::open(path, OpenPolicy::OpenExisting, AccessMode::Read)?;
        Ok(())
    }

    #[must_use]
    pub fn has_attached_storage(&self) -> bool {
        self.pool.has_attached_storage()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.pool.is_read_only()
    }

    /// Number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        if !self.has_attached_storage() {
            return 0;
        }
        self.pool.value_count() as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tree height; 1 means the root is a leaf, 0 an empty tree.
    #[must_use]
    pub fn depth(&self) -> u32 {
        if !self.has_attached_storage() {
            return 0;
        }
        self.pool.depth()
    }

    #[must_use]
    pub fn comparator(&self) -> &C {
        &self.comp
    }

    /// Values the current node pool can hold without growing, given the
    /// worst-case inner-node overhead at the current depth.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let nodes = self.pool.node_capacity();
        if nodes == 0 {
            return 0;
        }

        let depth = self.pool.depth();
        let mut max_inner_nodes: usize = usize::from(depth > 1);
        for _ in 3..=depth {
            max_inner_nodes += max_inner_nodes * InnerLayout::<K>::ORDER;
        }
        max_inner_nodes = max_inner_nodes.min(nodes.saturating_sub(1));
        (nodes - max_inner_nodes) * Self::LEAF_MAX
    }

    /// Pre-sizes the pool for `additional` more values.
    pub fn reserve_additional(&mut self, additional: usize) -> Result<()> {
        self.ensure_storage()?;
        self.pool
            .reserve_nodes(Self::node_count_for_values(additional))
    }

    /// Drops every value. Storage stays attached, capacity is kept.
    pub fn clear(&mut self) {
        if self.has_attached_storage() && !self.is_read_only() {
            self.pool.clear();
        }
    }

    /// Schedules dirty pages for writeback.
    pub fn flush_async(&self) -> Result<()> {
        if self.has_attached_storage() {
            self.pool.flush_async()
        } else {
            Ok(())
        }
    }

    /// Flushes the pool to durable storage and waits for completion.
    pub fn flush_blocking(&self) -> Result<()> {
        if self.has_attached_storage() {
            self.pool.flush_blocking()
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // queries

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        !self.is_empty() && self.find_nodes_for(key).pos.exact
    }

    /// Returns the stored key equivalent to `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<K> {
        if self.is_empty() {
            return None;
        }
        let loc = self.find_nodes_for(key);
        loc.pos
            .exact
            .then(|| self.pool.leaf(loc.leaf).key(loc.pos.pos))
    }

    /// Cursor to the stored key equivalent to `key`.
    #[must_use]
    pub fn find(&self, key: &K) -> Option<Cursor> {
        if self.is_empty() {
            return None;
        }
        let loc = self.find_nodes_for(key);
        loc.pos.exact.then_some(Cursor {
            slot: loc.leaf,
            offset: loc.pos.pos,
        })
    }

    /// Cursor to the first stored key not ordering before `key` (the end
    /// cursor if every key does).
    #[must_use]
    pub fn lower_bound(&self, key: &K) -> Cursor {
        if self.is_empty() {
            return Cursor::END;
        }

        let loc = self.find_nodes_for(key);
        let leaf = self.pool.leaf(loc.leaf);
        if loc.pos.pos == leaf.node().num_vals() {
            let right = leaf.node().right();
            if right.is_null() {
                return Cursor::END;
            }
            return Cursor {
                slot: right,
                offset: 0,
            };
        }
        Cursor {
            slot: loc.leaf,
            offset: loc.pos.pos,
        }
    }

    #[must_use]
    pub fn first(&self) -> Option<K> {
        let slot = self.pool.first_leaf();
        if self.is_empty() || slot.is_null() {
            return None;
        }
        Some(self.pool.leaf(slot).key(0))
    }

    #[must_use]
    pub fn last(&self) -> Option<K> {
        let slot = self.pool.last_leaf();
        if self.is_empty() || slot.is_null() {
            return None;
        }
        let leaf = self.pool.leaf(slot);
        Some(leaf.key(leaf.node().num_vals() - 1))
    }

    /// The key a cursor points at, if it is not the end cursor.
    #[must_use]
    pub fn key_at(&self, cursor: Cursor) -> Option<K> {
        if cursor.is_end() {
            return None;
        }
        let leaf = self.pool.leaf(cursor.slot);
        (cursor.offset < leaf.node().num_vals()).then(|| leaf.key(cursor.offset))
    }

    // ------------------------------------------------------------------
    // single-value insert

    /// Inserts `key`. Returns `false` (with the tree unchanged) when an
    /// equivalent key already exists in a unique tree.
    pub fn insert(&mut self, key: K) -> Result<bool> {
        self.ensure_writable()?;
        self.ensure_storage()?;

        if self.is_empty() {
            self.create_root_leaf(key)?;
            return Ok(true);
        }

        let loc = self.find_nodes_for(&key);
        if UNIQUE && loc.pos.exact {
            return Ok(false);
        }

        if self.pool.leaf(loc.leaf).node().num_vals() == Self::LEAF_MAX {
            self.ensure_split_capacity(loc.leaf)?;
        }
        self.insert_into_leaf(loc.leaf, loc.pos.pos, key)?;

        self.pool.set_value_count(self.pool.value_count() + 1);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // single-value erase

    /// Removes stored keys equivalent to `key`: at most one from a unique
    /// tree, every one from a multiset. Returns the number removed.
    pub fn remove(&mut self, key: &K) -> usize {
        assert!(!self.is_read_only(), "tree is read-only");

        let mut removed = 0;
        loop {
            if self.is_empty() {
                return removed;
            }

            let loc = self.find_nodes_for(key);
            if !loc.pos.exact {
                return removed;
            }

            let leaf = self.pool.leaf(loc.leaf);
            if !loc.inner.is_null() && loc.pos.pos == 0 {
                // the erased key doubles as a separator copy higher up
                if leaf.node().num_vals() > 1 {
                    self.pool
                        .inner(loc.inner)
                        .set_key(loc.inner_offset, leaf.key(1));
                }
            } else if loc.pos.pos == 0
                && !leaf.node().left().is_null()
                && leaf.node().num_vals() > 1
            {
                let successor = leaf.key(1);
                self.update_separator(loc.leaf, successor);
            }

            self.erase_from_leaf(loc.leaf, loc.pos.pos);
            removed += 1;

            if UNIQUE {
                return removed;
            }
        }
    }

    /// Removes the entry a cursor points at; returns the cursor to the
    /// following entry (or the end cursor).
    pub fn remove_at(&mut self, cursor: Cursor) -> Cursor {
        assert!(!self.is_read_only(), "tree is read-only");
        debug_assert!(!cursor.is_end());

        let leaf = self.pool.leaf(cursor.slot);
        debug_assert!(cursor.offset < leaf.node().num_vals());

        if cursor.offset == 0 && !leaf.node().left().is_null() && leaf.node().num_vals() > 1 {
            let successor = leaf.key(1);
            self.update_separator(cursor.slot, successor);
        }

        self.erase_from_leaf(cursor.slot, cursor.offset)
    }

    // ------------------------------------------------------------------
    // descent

    fn find_in_leaf(&self, leaf: LeafRef<K>, key: &K) -> FindPos {
        find_in_keys(leaf.keys(), key, &self.comp, Self::LEAF_LINEAR)
    }

    fn find_in_inner(&self, inner: InnerRef<K>, key: &K) -> FindPos {
        find_in_keys(inner.keys(), key, &self.comp, Self::INNER_LINEAR)
    }

    /// Root-to-leaf walk. For unique trees an exact separator hit descends
    /// into the right child (the key is the right child's first entry); a
    /// multiset descends plainly and lands on the leftmost equivalent.
    pub(crate) fn find_nodes_for(&self, key: &K) -> KeyLocation {
        debug_assert!(!self.is_empty());

        let depth = self.pool.depth();
        let mut slot = self.pool.root();
        let mut separator_node = NodeSlot::NULL;
        let mut separator_offset = 0;

        for _ in 1..depth {
            let inner = self.pool.inner(slot);
            let mut found = self.find_in_inner(inner, key);
            if UNIQUE && found.exact {
                debug_assert!(separator_node.is_null());
                separator_node = slot;
                separator_offset = found.pos;
                found.pos += 1;
            }
            slot = inner.child(found.pos);
        }

        // Even on a separator hit the leaf is searched: the separator only
        // guides the descent, so a copy left stale by a bulk erase can
        // never fabricate a match.
        let leaf = self.pool.leaf(slot);
        let pos = self.find_in_leaf(leaf, key);

        if !UNIQUE && pos.pos == leaf.node().num_vals() {
            // the leftmost equivalent may be the right neighbour's first key
            let right = leaf.node().right();
            if !right.is_null() {
                let right_leaf = self.pool.leaf(right);
                if self.comp.eq(key, &right_leaf.key(0)) {
                    return KeyLocation {
                        leaf: right,
                        pos: FindPos { pos: 0, exact: true },
                        inner: NodeSlot::NULL,
                        inner_offset: 0,
                    };
                }
            }
        }

        KeyLocation {
            leaf: slot,
            pos,
            inner: separator_node,
            inner_offset: separator_offset,
        }
    }

    /// Seeks forward from a known position to where `key` belongs,
    /// climbing only as far as needed. Amortised constant for presorted
    /// probes.
    pub(crate) fn find_next(&self, start_leaf: NodeSlot, start_offset: usize, key: &K) -> (NodeSlot, FindPos) {
        let leaf = self.pool.leaf(start_leaf);
        let n = leaf.node().num_vals();
        debug_assert!(n > 0);

        if self.comp.leq(key, &leaf.key(n - 1)) {
            let keys = leaf.keys();
            let mut found = find_in_keys(
                &keys[start_offset.min(n)..],
                key,
                &self.comp,
                Self::LEAF_LINEAR,
            );
            found.pos += start_offset.min(n);
            return (start_leaf, found);
        }

        if leaf.node().right().is_null() {
            return (start_leaf, FindPos { pos: n, exact: false });
        }

        // climb while the key lies beyond this ancestor
        let depth = self.pool.depth();
        debug_assert!(depth >= 2);
        let mut level = depth - 1; // parents of leaves
        let mut slot = leaf.node().parent();
        let mut offset = leaf.node().parent_child_idx();

        loop {
            let inner = self.pool.inner(slot);
            let num = inner.node().num_vals();
            if !self.comp.less(&inner.key(num - 1), key) {
                offset = offset.min(num - 1);
                break;
            }
            if level == 1 {
                // reached the root; the key is beyond everything seen yet
                // still lies within the tree (checked at entry)
                offset = offset.min(num - 1);
                break;
            }
            offset = inner.node().parent_child_idx();
            slot = inner.node().parent();
            level -= 1;
        }

        // descend to the containing leaf
        while level < depth {
            let inner = self.pool.inner(slot);
            let keys = inner.keys();
            let mut found = find_in_keys(&keys[offset..], key, &self.comp, Self::INNER_LINEAR);
            found.pos += offset;
            if UNIQUE && found.exact {
                found.pos += 1;
            }
            slot = inner.child(found.pos);
            offset = 0;
            level += 1;
        }

        let containing = self.pool.leaf(slot);
        (slot, self.find_in_leaf(containing, key))
    }

    // ------------------------------------------------------------------
    // structure helpers

    fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only() {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn ensure_storage(&mut self) -> Result<()> {
        if !self.has_attached_storage() {
            self.map_memory(0)?;
        }
        Ok(())
    }

    fn create_root_leaf(&mut self, key: K) -> Result<()> {
        let slot = self.pool.allocate_node()?;
        let leaf = self.pool.leaf(slot);
        leaf.set_key(0, key);
        leaf.node().set_num_vals(1);

        self.pool.set_root(slot);
        self.pool.set_first_leaf(slot);
        self.pool.set_last_leaf(slot);
        self.pool.set_depth(1);
        self.pool.set_value_count(self.pool.value_count() + 1);
        Ok(())
    }

    /// Reserves every node a worst-case split chain from `leaf_slot` to the
    /// root could allocate, so the chain itself cannot fail midway.
    pub(crate) fn ensure_split_capacity(&mut self, leaf_slot: NodeSlot) -> Result<()> {
        let mut needed = 1; // the new right sibling
        let mut slot = leaf_slot;
        loop {
            let node = self.pool.node(slot);
            let parent = node.parent();
            if parent.is_null() {
                needed += 1; // splitting the root makes a new one
                break;
            }
            if self.pool.inner(parent).node().num_vals() < Self::INNER_MAX {
                break;
            }
            needed += 1;
            slot = parent;
        }
        self.pool.reserve_nodes(needed)
    }

    pub(crate) fn link(&self, left: NodeSlot, right: NodeSlot) {
        self.pool.node(left).set_right(right);
        self.pool.node(right).set_left(left);
    }

    fn link_insert_after(&self, left: NodeSlot, new: NodeSlot) {
        let old_right = self.pool.node(left).right();
        self.pool.node(new).set_left(left);
        self.pool.node(new).set_right(old_right);
        if !old_right.is_null() {
            self.pool.node(old_right).set_left(new);
        }
        self.pool.node(left).set_right(new);
    }

    fn unlink_node(&self, slot: NodeSlot) {
        let node = self.pool.node(slot);
        let left = node.left();
        let right = node.right();
        if !left.is_null() {
            self.pool.node(left).set_right(right);
        }
        if !right.is_null() {
            self.pool.node(right).set_left(left);
        }
    }

    /// Unlinks a leaf from the leaf chain and returns it to the free pool.
    pub(crate) fn free_leaf(&mut self, slot: NodeSlot) {
        let node = self.pool.node(slot);
        if self.pool.first_leaf() == slot {
            self.pool.set_first_leaf(node.right());
        }
        if self.pool.last_leaf() == slot {
            self.pool.set_last_leaf(node.left());
        }
        self.unlink_node(slot);
        self.pool.free_node(slot);
    }

    /// Rewrites the separator copy of this leaf's first key in the nearest
    /// ancestor where the leaf is not the leftmost descendant.
    pub(crate) fn update_separator(&mut self, leaf_slot: NodeSlot, new_separator: K) {
        let node = self.pool.node(leaf_slot);
        if node.left().is_null() {
            // the leftmost leaf has no separator at all
            debug_assert_eq!(node.parent_child_idx(), 0);
            return;
        }

        let mut idx = node.parent_child_idx();
        let mut parent = node.parent();
        while idx == 0 {
            let p = self.pool.node(parent);
            idx = p.parent_child_idx();
            parent = p.parent();
        }

        debug_assert!(!parent.is_null());
        self.pool.inner(parent).set_key(idx - 1, new_separator);
    }

    // ------------------------------------------------------------------
    // insert internals

    /// Infallible after [`ensure_split_capacity`](Self::ensure_split_capacity);
    /// the `Result` keeps the allocation honest.
    pub(crate) fn insert_into_leaf(
        &mut self,
        slot: NodeSlot,
        pos: usize,
        key: K,
    ) -> Result<InsertPos> {
        let leaf = self.pool.leaf(slot);
        let n = leaf.node().num_vals();

        if n == Self::LEAF_MAX {
            return self.split_leaf_to_insert(slot, pos, key);
        }

        leaf.rshift_keys(pos, n);
        leaf.set_key(pos, key);
        leaf.node().set_num_vals(n + 1);
        Ok(InsertPos {
            node: slot,
            next_offset: pos + 1,
        })
    }

    fn split_leaf_to_insert(&mut self, slot: NodeSlot, insert_pos: usize, key: K) -> Result<InsertPos> {
        let new_slot = self.pool.allocate_node()?;
        let node = self.pool.leaf(slot);
        let new = self.pool.leaf(new_slot);
        self.link_insert_after(slot, new_slot);

        let max = Self::LEAF_MAX;
        let mid = Self::LEAF_MIN;
        debug_assert_eq!(node.node().num_vals(), max);

        // the old node keeps exactly `mid`; the new right sibling takes the
        // rest plus the incoming key
        let result = if insert_pos >= mid {
            let new_pos = insert_pos - mid;
            new.copy_keys_from(node, mid, 0, insert_pos - mid);
            new.copy_keys_from(node, insert_pos, new_pos + 1, max - insert_pos);
            new.set_key(new_pos, key);
            node.node().set_num_vals(mid);
            new.node().set_num_vals(max - mid + 1);
            InsertPos {
                node: new_slot,
                next_offset: new_pos + 1,
            }
        } else {
            new.copy_keys_from(node, mid - 1, 0, max - (mid - 1));
            node.rshift_keys(insert_pos, mid - 1);
            node.set_key(insert_pos, key);
            node.node().set_num_vals(mid);
            new.node().set_num_vals(max - mid + 1);
            InsertPos {
                node: slot,
                next_offset: insert_pos + 1,
            }
        };

        if self.pool.last_leaf() == slot {
            self.pool.set_last_leaf(new_slot);
        }

        // the new leaf's first key becomes the separator
        let separator = new.key(0);
        self.propagate_split(slot, new_slot, separator)?;
        Ok(result)
    }

    pub(crate) fn insert_into_inner(
        &mut self,
        slot: NodeSlot,
        key_pos: usize,
        key: K,
        right_child: NodeSlot,
    ) -> Result<InsertPos> {
        let inner = self.pool.inner(slot);
        let n = inner.node().num_vals();

        if n == Self::INNER_MAX {
            return self.split_inner_to_insert(slot, key_pos, key, right_child);
        }

        inner.rshift_keys(key_pos, n);
        self.pool.rshift_children(inner, key_pos + 1, n + 1);
        inner.set_key(key_pos, key);
        self.pool.set_child(inner, key_pos + 1, right_child, slot);
        inner.node().set_num_vals(n + 1);
        Ok(InsertPos {
            node: slot,
            next_offset: key_pos + 1,
        })
    }

    fn split_inner_to_insert(
        &mut self,
        slot: NodeSlot,
        insert_pos: usize,
        key: K,
        right_child: NodeSlot,
    ) -> Result<InsertPos> {
        let new_slot = self.pool.allocate_node()?;
        let node = self.pool.inner(slot);
        let new = self.pool.inner(new_slot);
        self.link_insert_after(slot, new_slot);

        let max = Self::INNER_MAX;
        let mid = Self::INNER_MIN;
        debug_assert_eq!(node.node().num_vals(), max);

        let (separator, result) = if insert_pos >= mid {
            let new_pos = insert_pos - mid;
            if new_pos == 0 {
                // the incoming key is the median and gets promoted directly
                for i in 0..(max - mid) {
                    new.set_key(i, node.key(mid + i));
                }
                node.node().set_num_vals(mid);
                new.node().set_num_vals(max - mid);
                self.pool.move_children(node, mid + 1, new, new_slot, 1, max - mid);
                self.pool.set_child(new, 0, right_child, new_slot);
                (
                    key,
                    InsertPos {
                        node: new_slot,
                        next_offset: 0,
                    },
                )
            } else {
                let separator = node.key(mid);
                for i in 0..(new_pos - 1) {
                    new.set_key(i, node.key(mid + 1 + i));
                }
                for i in 0..(max - insert_pos) {
                    new.set_key(new_pos + i, node.key(insert_pos + i));
                }
                new.set_key(new_pos - 1, key);
                node.node().set_num_vals(mid);
                new.node().set_num_vals(max - mid);
                self.pool.move_children(node, mid + 1, new, new_slot, 0, new_pos);
                self.pool
                    .move_children(node, insert_pos + 1, new, new_slot, new_pos + 1, max - insert_pos);
                self.pool.set_child(new, new_pos, right_child, new_slot);
                (
                    separator,
                    InsertPos {
                        node: new_slot,
                        next_offset: new_pos,
                    },
                )
            }
        } else {
            // the median of the old node is promoted; the incoming key goes
            // into the old node
            let separator = node.key(mid - 1);
            for i in 0..(max - mid) {
                new.set_key(i, node.key(mid + i));
            }
            self.pool.move_children(node, mid, new, new_slot, 0, max + 1 - mid);
            node.rshift_keys(insert_pos, mid - 1);
            self.pool.rshift_children(node, insert_pos + 1, mid);
            node.set_key(insert_pos, key);
            self.pool.set_child(node, insert_pos + 1, right_child, slot);
            node.node().set_num_vals(mid);
            new.node().set_num_vals(max - mid);
            (
                separator,
                InsertPos {
                    node: slot,
                    next_offset: insert_pos + 1,
                },
            )
        };

        self.propagate_split(slot, new_slot, separator)?;
        Ok(result)
    }

    fn propagate_split(&mut self, slot: NodeSlot, new_slot: NodeSlot, separator: K) -> Result<()> {
        let node = self.pool.node(slot);
        if node.is_root() {
            self.new_root(slot, new_slot, separator)?;
        } else {
            let parent = node.parent();
            let key_pos = node.parent_child_idx();
            self.insert_into_inner(parent, key_pos, separator, new_slot)?;
        }
        Ok(())
    }

    pub(crate) fn new_root(&mut self, left: NodeSlot, right: NodeSlot, separator: K) -> Result<()> {
        let root_slot = self.pool.allocate_node()?;
        let root = self.pool.inner(root_slot);
        root.set_key(0, separator);
        root.node().set_num_vals(1);
        self.pool.set_child(root, 0, left, root_slot);
        self.pool.set_child(root, 1, right, root_slot);
        self.pool.set_root(root_slot);
        self.pool.set_depth(self.pool.depth() + 1);
        Ok(())
    }

    // ------------------------------------------------------------------
    // erase internals

    /// Removes `keys[offset]` from the leaf, rebalances, and returns the
    /// cursor to the logical successor of the erased entry.
    pub(crate) fn erase_from_leaf(&mut self, slot: NodeSlot, offset: usize) -> Cursor {
        let leaf = self.pool.leaf(slot);
        let n = leaf.node().num_vals();
        debug_assert!(offset < n);

        leaf.lshift_keys(offset + 1, n);
        leaf.node().set_num_vals(n - 1);

        self.pool.set_value_count(self.pool.value_count() - 1);

        if self.pool.depth() == 1 {
            // a lone leaf root underflows only into emptiness
            if n - 1 == 0 {
                self.free_leaf(slot);
                self.pool.set_root(NodeSlot::NULL);
                self.pool.set_depth(0);
                return Cursor::END;
            }
            return self.normalize_cursor(slot, offset);
        }

        let mut next = Cursor { slot, offset };
        if n - 1 < Self::LEAF_MIN {
            let rebalanced = self.handle_leaf_underflow(slot);
            next = Cursor {
                slot: rebalanced.slot,
                offset: rebalanced.offset + offset,
            };
        }

        self.normalize_cursor(next.slot, next.offset)
    }

    fn normalize_cursor(&self, slot: NodeSlot, offset: usize) -> Cursor {
        let leaf = self.pool.leaf(slot);
        if offset >= leaf.node().num_vals() {
            let right = leaf.node().right();
            if right.is_null() {
                return Cursor::END;
            }
            return Cursor {
                slot: right,
                offset: 0,
            };
        }
        Cursor { slot, offset }
    }

    /// Borrows from the richer sibling, or merges; loops until occupancy is
    /// restored (bulk erase can leave a leaf far below the minimum).
    /// Returns where the underflowed node's keys ended up: the surviving
    /// node and the offset its original key 0 now lives at.
    pub(crate) fn handle_leaf_underflow(&mut self, slot: NodeSlot) -> Cursor {
        let mut offset_delta = 0usize;

        loop {
            let node = self.pool.leaf(slot);
            let n = node.node().num_vals();
            if n >= Self::LEAF_MIN {
                return Cursor {
                    slot,
                    offset: offset_delta,
                };
            }

            let parent_slot = node.node().parent();
            debug_assert!(!parent_slot.is_null());
            let parent = self.pool.inner(parent_slot);
            let idx = node.node().parent_child_idx();
            debug_assert!(parent.child(idx) == slot);

            let has_left = idx > 0;
            let has_right = idx + 1 < parent.num_children();
            debug_assert!(has_left || has_right);

            // borrow from the left sibling if it can spare a key
            if has_left {
                let left_slot = parent.child(idx - 1);
                let left = self.pool.leaf(left_slot);
                let ln = left.node().num_vals();
                if ln > Self::LEAF_MIN {
                    if n > 0 {
                        node.rshift_keys(0, n);
                    }
                    node.set_key(0, left.key(ln - 1));
                    node.node().set_num_vals(n + 1);
                    left.node().set_num_vals(ln - 1);
                    parent.set_key(idx - 1, node.key(0));
                    offset_delta += 1;
                    continue;
                }
            }

            // then from the right sibling
            if has_right {
                let right_slot = parent.child(idx + 1);
                let right = self.pool.leaf(right_slot);
                let rn = right.node().num_vals();
                if rn > Self::LEAF_MIN {
                    node.set_key(n, right.key(0));
                    node.node().set_num_vals(n + 1);
                    right.lshift_keys(1, rn);
                    right.node().set_num_vals(rn - 1);
                    parent.set_key(idx, right.key(0));
                    continue;
                }
            }

            // merge, left sibling preferred
            if has_left {
                let left_slot = parent.child(idx - 1);
                let left = self.pool.leaf(left_slot);
                let ln = left.node().num_vals();
                left.copy_keys_from(node, 0, ln, n);
                left.node().set_num_vals(ln + n);
                self.remove_parent_entry(parent_slot, idx - 1, idx);
                self.free_leaf(slot);
                self.fix_parent_after_merge(parent_slot);
                return Cursor {
                    slot: left_slot,
                    offset: ln + offset_delta,
                };
            }

            let right_slot = parent.child(idx + 1);
            let right = self.pool.leaf(right_slot);
            let rn = right.node().num_vals();
            node.copy_keys_from(right, 0, n, rn);
            node.node().set_num_vals(n + rn);
            self.remove_parent_entry(parent_slot, idx, idx + 1);
            self.free_leaf(right_slot);
            self.fix_parent_after_merge(parent_slot);
            return Cursor {
                slot,
                offset: offset_delta,
            };
        }
    }

    /// Removes `keys[key_idx]` and `children[child_idx]` from an inner
    /// node.
    fn remove_parent_entry(&mut self, parent_slot: NodeSlot, key_idx: usize, child_idx: usize) {
        let parent = self.pool.inner(parent_slot);
        let n = parent.node().num_vals();
        debug_assert!(key_idx < n && child_idx <= n);
        parent.lshift_keys(key_idx + 1, n);
        self.pool.lshift_children(parent, child_idx + 1, n + 1);
        parent.node().set_num_vals(n - 1);
    }

    fn fix_parent_after_merge(&mut self, parent_slot: NodeSlot) {
        let parent = self.pool.inner(parent_slot);
        if parent.node().is_root() {
            debug_assert_eq!(self.pool.root(), parent_slot);
            // the root may underflow down to a single child; at zero keys
            // it is replaced by that child
            if parent.node().num_vals() == 0 {
                let only_child = parent.child(0);
                self.pool.node(only_child).set_parent_link(NodeSlot::NULL, 0);
                self.pool.set_root(only_child);
                self.pool.set_depth(self.pool.depth() - 1);
                self.unlink_node(parent_slot);
                self.pool.free_node(parent_slot);
            }
        } else if parent.node().num_vals() < Self::INNER_MIN {
            self.handle_inner_underflow(parent_slot);
        }
    }

    fn handle_inner_underflow(&mut self, slot: NodeSlot) {
        loop {
            let node = self.pool.inner(slot);
            let n = node.node().num_vals();
            if n >= Self::INNER_MIN {
                return;
            }

            let parent_slot = node.node().parent();
            debug_assert!(!parent_slot.is_null());
            let parent = self.pool.inner(parent_slot);
            let idx = node.node().parent_child_idx();

            let has_left = idx > 0;
            let has_right = idx + 1 < parent.num_children();
            debug_assert!(has_left || has_right);

            // rotate through the parent from the left sibling
            if has_left {
                let left_slot = parent.child(idx - 1);
                let left = self.pool.inner(left_slot);
                let ln = left.node().num_vals();
                if ln > Self::INNER_MIN {
                    node.rshift_keys(0, n);
                    self.pool.rshift_children(node, 0, n + 1);
                    node.set_key(0, parent.key(idx - 1));
                    parent.set_key(idx - 1, left.key(ln - 1));
                    self.pool.set_child(node, 0, left.child(ln), slot);
                    node.node().set_num_vals(n + 1);
                    left.node().set_num_vals(ln - 1);
                    continue;
                }
            }

            // or from the right sibling
            if has_right {
                let right_slot = parent.child(idx + 1);
                let right = self.pool.inner(right_slot);
                let rn = right.node().num_vals();
                if rn > Self::INNER_MIN {
                    node.set_key(n, parent.key(idx));
                    parent.set_key(idx, right.key(0));
                    self.pool.set_child(node, n + 1, right.child(0), slot);
                    node.node().set_num_vals(n + 1);
                    right.lshift_keys(1, rn);
                    self.pool.lshift_children(right, 1, rn + 1);
                    right.node().set_num_vals(rn - 1);
                    continue;
                }
            }

            // merge around the separator, left preferred
            if has_left {
                let left_slot = parent.child(idx - 1);
                self.merge_inner_into_left(left_slot, slot, parent_slot, idx - 1, idx);
            } else {
                let right_slot = parent.child(idx + 1);
                self.merge_inner_into_left(slot, right_slot, parent_slot, idx, idx + 1);
            }
            self.fix_parent_after_merge(parent_slot);
            return;
        }
    }

    /// Pulls the separator down between the two nodes and concatenates
    /// `right` into `left`.
    fn merge_inner_into_left(
        &mut self,
        left_slot: NodeSlot,
        right_slot: NodeSlot,
        parent_slot: NodeSlot,
        separator_idx: usize,
        child_rm_idx: usize,
    ) {
        let left = self.pool.inner(left_slot);
        let right = self.pool.inner(right_slot);
        let parent = self.pool.inner(parent_slot);
        let ln = left.node().num_vals();
        let rn = right.node().num_vals();
        debug_assert!(ln + 1 + rn <= Self::INNER_MAX);

        self.pool.move_children(right, 0, left, left_slot, ln + 1, rn + 1);
        left.set_key(ln, parent.key(separator_idx));
        for i in 0..rn {
            left.set_key(ln + 1 + i, right.key(i));
        }
        left.node().set_num_vals(ln + 1 + rn);

        self.unlink_node(right_slot);
        self.remove_parent_entry(parent_slot, separator_idx, child_rm_idx);
        self.pool.free_node(right_slot);
    }

    // ------------------------------------------------------------------
    // sizing

    /// Nodes needed to hold `values`, assuming densely packed leaves and
    /// pessimistic inner-node utilisation.
    pub(crate) fn node_count_for_values(values: usize) -> usize {
        if values == 0 {
            return 0;
        }
        let leaves = values.div_ceil(Self::LEAF_MAX);
        let mut total = 0;
        let mut level = leaves;
        while level > 1 {
            total += level;
            level = level.div_ceil(InnerLayout::<K>::MIN_CHILDREN);
        }
        total + 1 // the root
    }
}

const NODE_ALIGN_LIMIT: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn empty_tree_queries() {
        let tree = BpSet::<u64>::new();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert!(!tree.contains(&1));
        assert_eq!(tree.get(&1), None);
        assert!(tree.iter().next().is_none());
        assert!(tree.lower_bound(&1).is_end());
        tree.check_invariants();
    }

    #[test]
    fn single_element_neighbours() {
        let mut tree = BpSet::<i64>::new();
        assert!(tree.insert(10).expect("insert"));

        // a smaller key becomes the new first, a larger one the new last
        assert!(tree.insert(5).expect("insert"));
        assert!(tree.insert(20).expect("insert"));
        assert_eq!(tree.first(), Some(5));
        assert_eq!(tree.last(), Some(20));
        assert_eq!(tree.iter().collect::<Vec<_>>(), vec![5, 10, 20]);
        tree.check_invariants();
    }

    #[test]
    fn unique_insert_is_idempotent() {
        let mut tree = BpSet::<u32>::new();
        assert!(tree.insert(7).expect("insert"));
        assert!(!tree.insert(7).expect("insert"));
        assert_eq!(tree.len(), 1);
        tree.check_invariants();
    }

    #[test]
    fn exactly_full_leaf_insert_splits() {
        let mut tree = BpSet::<u64>::new();
        let max = BpSet::<u64>::LEAF_MAX;

        for i in 0..max as u64 {
            assert!(tree.insert(i).expect("insert"));
        }
        assert_eq!(tree.depth(), 1);

        assert!(tree.insert(max as u64).expect("insert"));
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.len(), max + 1);
        tree.check_invariants();
    }

    #[test]
    fn exactly_minimal_leaf_erase_rebalances() {
        let mut tree = BpSet::<u64>::new();
        let max = BpSet::<u64>::LEAF_MAX as u64;

        for i in 0..=max {
            tree.insert(i).expect("insert");
        }
        assert_eq!(tree.depth(), 2);

        // drain one leaf below its minimum; borrows and merges kick in
        for i in 0..=max {
            assert_eq!(tree.remove(&i), 1);
            tree.check_invariants();
        }
        assert!(tree.is_empty());
        assert_eq!(tree.depth(), 0);
    }

    #[test]
    fn erase_returns_successor_cursor() {
        let mut tree = BpSet::<u32>::new();
        for i in 0..100 {
            tree.insert(i).expect("insert");
        }

        let cursor = tree.find(&42).expect("present");
        let next = tree.remove_at(cursor);
        assert_eq!(tree.key_at(next), Some(43));
        assert!(!tree.contains(&42));

        let last = tree.find(&99).expect("present");
        assert!(tree.remove_at(last).is_end());
    }

    #[test]
    fn lower_bound_hops_between_leaves() {
        let mut tree = BpSet::<u64>::new();
        let max = BpSet::<u64>::LEAF_MAX as u64;

        // two leaves with even keys
        for i in 0..=max {
            tree.insert(i * 2).expect("insert");
        }

        for probe in 0..max {
            let cursor = tree.lower_bound(&(probe * 2 + 1));
            assert_eq!(tree.key_at(cursor), Some(probe * 2 + 2));
        }

        let beyond = tree.lower_bound(&(max * 2 + 1));
        assert!(beyond.is_end());
    }

    #[test]
    fn capacity_projection_is_monotonic() {
        let mut tree = BpSet::<u64>::new();
        tree.map_memory(100_000).expect("map");
        assert!(tree.capacity() >= 100_000);
        assert_eq!(tree.len(), 0);
    }
}
