// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bulk operations: staged bulk insert, rightmost append, merging a whole
//! tree, sorted bulk erase and in-place key replacement.

use super::node::NodeSlot;
use super::search::{find_in_keys, upper_bound};
use super::{BpTree, InsertPos};
use crate::comparator::Comparator;
use crate::Result;
use bytemuck::Pod;

/// Freshly allocated leaves holding the (copied) bulk input, linked into a
/// chain that is not yet part of the tree structure.
pub(crate) struct StagedChain {
    slots: Vec<NodeSlot>,
    total: usize,
}

impl<K, C, const UNIQUE: bool> BpTree<K, C, UNIQUE>
where
    K: Pod,
    C: Comparator<K>,
{
    // ------------------------------------------------------------------
    // public bulk API

    /// Inserts a batch of keys in any order. Far faster than repeated
    /// [`insert`](Self::insert) for large batches. For a unique tree,
    /// keys equivalent to existing entries (or to each other) are
    /// skipped. Returns the number inserted.
    pub fn insert_many(&mut self, keys: &[K]) -> Result<usize> {
        self.bulk_insert(keys, true)
    }

    /// Like [`insert_many`](Self::insert_many) for input already sorted by
    /// the tree's comparator. Feeding unsorted input is a contract
    /// violation.
    pub fn insert_presorted(&mut self, keys: &[K]) -> Result<usize> {
        debug_assert!(self.input_is_sorted(keys));
        self.bulk_insert(keys, false)
    }

    /// Erases the first stored equivalent of each input key; input sorted
    /// by the comparator. Absent keys are tolerated. Returns the number
    /// erased.
    pub fn remove_sorted(&mut self, keys: &[K]) -> usize {
        self.remove_sorted_impl(keys, false)
    }

    /// Like [`remove_sorted`](Self::remove_sorted), but a stored key is
    /// only erased when it is both comparator-equivalent **and** bitwise
    /// equal to the input key. With comparators that look through an
    /// indirection this removes exactly the named entry and nothing else.
    pub fn remove_sorted_exact(&mut self, keys: &[K]) -> usize {
        self.remove_sorted_impl(keys, true)
    }

    /// Overwrites each stored key bitwise-equal to `old[i]` with `new[i]`,
    /// without any structural change. Each pair must be
    /// comparator-equivalent (the ordering is preserved by construction).
    /// Both arrays are sorted by the comparator. Returns the number
    /// replaced.
    pub fn replace_keys_inplace(&mut self, old: &[K], new: &[K]) -> usize {
        assert!(!self.is_read_only() || old.is_empty(), "tree is read-only");
        assert_eq!(old.len(), new.len());
        debug_assert!(self.input_is_sorted(old));
        debug_assert!(self.input_is_sorted(new));

        let mut count = 0;
        for (old_key, new_key) in old.iter().zip(new) {
            debug_assert!(self.comp.eq(old_key, new_key));
            if self.is_empty() {
                break;
            }

            let loc = self.find_nodes_for(old_key);
            if !loc.pos.exact {
                continue;
            }

            // scan the equivalence run for the bitwise match
            let mut slot = loc.leaf;
            let mut pos = loc.pos.pos;
            loop {
                let leaf = self.pool.leaf(slot);
                if pos >= leaf.node().num_vals() {
                    let right = leaf.node().right();
                    if right.is_null() {
                        break;
                    }
                    slot = right;
                    pos = 0;
                    continue;
                }

                let stored = leaf.key(pos);
                if !self.comp.eq(&stored, old_key) {
                    break;
                }
                if bytemuck::bytes_of(&stored) == bytemuck::bytes_of(old_key) {
                    leaf.set_key(pos, *new_key);
                    if UNIQUE && !loc.inner.is_null() && slot == loc.leaf && pos == 0 {
                        // the key doubles as a separator copy
                        self.pool.inner(loc.inner).set_key(loc.inner_offset, *new_key);
                    } else if pos == 0 && !leaf.node().left().is_null() {
                        self.update_separator(slot, *new_key);
                    }
                    count += 1;
                    break;
                }
                pos += 1;
            }
        }
        count
    }

    /// Splices every key of `other` into `self`, leaving `other` empty.
    /// When `self` is empty the two storages are swapped instead (O(1)).
    /// Returns the number of keys inserted into `self`.
    pub fn merge_from(&mut self, other: &mut Self) -> Result<usize> {
        self.ensure_writable()?;

        if other.is_empty() {
            return Ok(0);
        }

        if self.is_empty() {
            if !self.has_attached_storage() {
                self.map_memory(0)?;
            }
            self.pool.swap(&mut other.pool);
            log::trace!("merge into empty tree: swapped storages");
            return Ok(self.len());
        }

        let total = other.len();
        self.reserve_additional(total)?;

        let mut scratch: Vec<K> = Vec::with_capacity(Self::LEAF_MAX);

        let mut src_slot = other.pool.first_leaf();
        let mut src_off = 0usize;
        let mut consumed = 0usize;
        let mut inserted = 0usize;

        let first_key = other.pool.leaf(src_slot).key(0);
        let start = self.find_nodes_for(&first_key);
        let mut tgt = start.leaf;
        let mut tgt_pos = start.pos;

        while consumed < total {
            {
                // normalize the source position onto a live key
                let mut leaf = other.pool.leaf(src_slot);
                while src_off >= leaf.node().num_vals() {
                    src_slot = leaf.node().right();
                    debug_assert!(!src_slot.is_null());
                    src_off = 0;
                    leaf = other.pool.leaf(src_slot);
                }
            }

            if UNIQUE && tgt_pos.exact {
                src_off += 1;
                consumed += 1;
                if consumed >= total {
                    break;
                }
                let (s, o) = Self::advance_source(&other.pool, src_slot, src_off);
                src_slot = s;
                src_off = o;
                let next_key = other.pool.leaf(src_slot).key(src_off);
                let (t, fp) = self.find_next(tgt, tgt_pos.pos, &next_key);
                tgt = t;
                tgt_pos = fp;
                continue;
            }

            let tgt_leaf = self.pool.leaf(tgt);
            if tgt_pos.pos == tgt_leaf.node().num_vals()
                && tgt_leaf.node().right().is_null()
                && total - consumed > Self::LEAF_MAX - tgt_leaf.node().num_vals()
            {
                // everything left is beyond the rightmost leaf: copy the
                // remaining source keys densely into fresh nodes (they
                // belong to a different pool and cannot be transplanted),
                // then append the chain wholesale
                let mut first_copy = NodeSlot::NULL;
                let mut prev = NodeSlot::NULL;
                let mut s = src_slot;
                let mut off = src_off;
                let mut left_to_copy = total - consumed;
                while left_to_copy > 0 {
                    let fresh = self.pool.allocate_node()?;
                    let fresh_leaf = self.pool.leaf(fresh);
                    let mut filled = 0;
                    while filled < Self::LEAF_MAX && left_to_copy > 0 {
                        let source = other.pool.leaf(s);
                        let sn = source.node().num_vals();
                        if off >= sn {
                            s = source.node().right();
                            debug_assert!(!s.is_null());
                            off = 0;
                            continue;
                        }
                        let take = (sn - off).min(Self::LEAF_MAX - filled);
                        fresh_leaf.write_keys(filled, &source.keys()[off..off + take]);
                        filled += take;
                        off += take;
                        left_to_copy -= take;
                    }
                    fresh_leaf.node().set_num_vals(filled);
                    if first_copy.is_null() {
                        first_copy = fresh;
                        self.link(tgt, fresh);
                        self.fill_incomplete_tail_leaf(fresh);
                    } else {
                        self.link(prev, fresh);
                    }
                    prev = fresh;
                }
                self.append_chain_at_end(first_copy, tgt)?;
                inserted += total - consumed;
                break;
            }

            scratch.clear();
            scratch.extend_from_slice(&other.pool.leaf(src_slot).keys()[src_off..]);
            let (ins, used, next_tgt, next_off) =
                self.merge_run_into_leaf(&scratch, tgt, tgt_pos.pos)?;
            inserted += ins;
            consumed += used;
            src_off += used;

            if consumed >= total {
                break;
            }
            let (s, o) = Self::advance_source(&other.pool, src_slot, src_off);
            src_slot = s;
            src_off = o;
            let next_key = other.pool.leaf(src_slot).key(src_off);
            let (t, fp) = self.find_next(next_tgt, next_off, &next_key);
            tgt = t;
            tgt_pos = fp;
        }

        self.pool
            .set_value_count(self.pool.value_count() + inserted as u64);
        other.clear();
        Ok(inserted)
    }

    // ------------------------------------------------------------------
    // bulk insert pipeline

    fn bulk_insert(&mut self, keys: &[K], sort: bool) -> Result<usize> {
        self.ensure_writable()?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut chain = self.stage_input(keys)?;
        if sort {
            self.sort_staged(&chain);
        }
        if UNIQUE {
            self.dedup_staged(&mut chain);
        }

        if self.is_empty() {
            let staged = chain.total;
            self.bulk_insert_into_empty(&chain)?;
            return Ok(staged);
        }

        self.bulk_merge_staged(&chain)
    }

    /// Copies the input into a chain of freshly allocated leaves, each
    /// filled to the maximum (except the last).
    fn stage_input(&mut self, keys: &[K]) -> Result<StagedChain> {
        self.reserve_additional(keys.len())?;

        let mut slots = Vec::with_capacity(keys.len().div_ceil(Self::LEAF_MAX));
        let mut prev = NodeSlot::NULL;
        let mut at = 0;
        while at < keys.len() {
            let slot = self.pool.allocate_node()?;
            let leaf = self.pool.leaf(slot);
            let count = (keys.len() - at).min(Self::LEAF_MAX);
            leaf.write_keys(0, &keys[at..at + count]);
            leaf.node().set_num_vals(count);
            if !prev.is_null() {
                self.link(prev, slot);
            }
            slots.push(slot);
            prev = slot;
            at += count;
        }

        Ok(StagedChain {
            slots,
            total: keys.len(),
        })
    }

    fn staged_get(&self, chain: &StagedChain, index: usize) -> K {
        let leaf = self.pool.leaf(chain.slots[index / Self::LEAF_MAX]);
        leaf.key(index % Self::LEAF_MAX)
    }

    fn staged_set(&self, chain: &StagedChain, index: usize, key: K) {
        let leaf = self.pool.leaf(chain.slots[index / Self::LEAF_MAX]);
        leaf.set_key(index % Self::LEAF_MAX, key);
    }

    fn staged_swap(&self, chain: &StagedChain, a: usize, b: usize) {
        let ka = self.staged_get(chain, a);
        let kb = self.staged_get(chain, b);
        self.staged_set(chain, a, kb);
        self.staged_set(chain, b, ka);
    }

    /// In-place sort of the staged chain, addressing keys through their
    /// global index (leaves are all full except the last one).
    fn sort_staged(&self, chain: &StagedChain) {
        if chain.total > 1 {
            self.staged_quicksort(chain, 0, chain.total);
        }
    }

    fn staged_quicksort(&self, chain: &StagedChain, mut lo: usize, mut hi: usize) {
        const INSERTION_CUTOFF: usize = 24;

        while hi - lo > INSERTION_CUTOFF {
            let pivot = self.staged_median_of_three(chain, lo, hi);

            // three-way partition so runs of equivalent keys cost O(n)
            let mut lt = lo;
            let mut gt = hi;
            let mut i = lo;
            while i < gt {
                let key = self.staged_get(chain, i);
                if self.comp.less(&key, &pivot) {
                    self.staged_swap(chain, i, lt);
                    lt += 1;
                    i += 1;
                } else if self.comp.less(&pivot, &key) {
                    gt -= 1;
                    self.staged_swap(chain, i, gt);
                } else {
                    i += 1;
                }
            }

            // recurse into the smaller side, iterate on the larger
            if lt - lo < hi - gt {
                self.staged_quicksort(chain, lo, lt);
                lo = gt;
            } else {
                self.staged_quicksort(chain, gt, hi);
                hi = lt;
            }
        }

        for i in lo + 1..hi {
            let key = self.staged_get(chain, i);
            let mut j = i;
            while j > lo && self.comp.less(&key, &self.staged_get(chain, j - 1)) {
                let shifted = self.staged_get(chain, j - 1);
                self.staged_set(chain, j, shifted);
                j -= 1;
            }
            self.staged_set(chain, j, key);
        }
    }

    fn staged_median_of_three(&self, chain: &StagedChain, lo: usize, hi: usize) -> K {
        let a = self.staged_get(chain, lo);
        let b = self.staged_get(chain, lo + (hi - lo) / 2);
        let c = self.staged_get(chain, hi - 1);

        if self.comp.less(&b, &a) {
            if self.comp.less(&c, &b) {
                b
            } else if self.comp.less(&c, &a) {
                c
            } else {
                a
            }
        } else if self.comp.less(&c, &a) {
            a
        } else if self.comp.less(&c, &b) {
            c
        } else {
            b
        }
    }

    /// Compacts away input keys equivalent to their predecessor, freeing
    /// emptied tail leaves. Unique trees must never receive internal
    /// duplicates through the bulk paths.
    fn dedup_staged(&mut self, chain: &mut StagedChain) {
        if chain.total < 2 {
            return;
        }

        let mut write = 1;
        let mut prev = self.staged_get(chain, 0);
        for read in 1..chain.total {
            let key = self.staged_get(chain, read);
            if !self.comp.eq(&key, &prev) {
                if write != read {
                    self.staged_set(chain, write, key);
                }
                prev = key;
                write += 1;
            }
        }

        if write == chain.total {
            return;
        }
        log::trace!("bulk input: dropped {} duplicate keys", chain.total - write);

        chain.total = write;
        let keep = write.div_ceil(Self::LEAF_MAX);
        for slot in chain.slots.drain(keep..) {
            self.pool.free_node(slot);
        }
        let tail = chain.slots[keep - 1];
        let tail_leaf = self.pool.leaf(tail);
        tail_leaf
            .node()
            .set_num_vals(write - (keep - 1) * Self::LEAF_MAX);
        tail_leaf.node().set_right(NodeSlot::NULL);
    }

    /// Promotes the staged chain wholesale into an empty tree.
    fn bulk_insert_into_empty(&mut self, chain: &StagedChain) -> Result<()> {
        debug_assert!(self.is_empty());

        let first = chain.slots[0];
        self.pool.set_root(first);
        self.pool.set_first_leaf(first);
        self.pool.set_last_leaf(first);
        self.pool.set_depth(1);

        if chain.slots.len() > 1 {
            let second = chain.slots[1];
            let separator = self.pool.leaf(second).key(0);
            self.new_root(first, second, separator)?;
            self.pool.set_last_leaf(second);

            if chain.slots.len() > 2 {
                let root = self.pool.root();
                self.bulk_append(
                    chain.slots[2],
                    InsertPos {
                        node: root,
                        next_offset: 1,
                    },
                )?;
            } else if self.fill_incomplete_tail_leaf(second) {
                let root = self.pool.inner(self.pool.root());
                root.set_key(0, self.pool.leaf(second).key(0));
            }
        }

        self.pool
            .set_value_count(self.pool.value_count() + chain.total as u64);
        Ok(())
    }

    /// Appends a chain of parentless leaves after the current rightmost
    /// position: each leaf's first key becomes a fresh separator in the
    /// rightmost inner node (splitting as needed).
    pub(crate) fn bulk_append(&mut self, first_src: NodeSlot, mut pos: InsertPos) -> Result<()> {
        let mut src = first_src;
        loop {
            debug_assert!(self.pool.node(src).parent().is_null());
            let next = self.pool.node(src).right();
            let separator = self.pool.leaf(src).key(0);
            pos = self.insert_into_inner(pos.node, pos.next_offset, separator, src)?;
            if next.is_null() {
                break;
            }
            src = next;
        }

        self.pool.set_last_leaf(src);
        if self.fill_incomplete_tail_leaf(src) {
            // the borrow happened after the separator was inserted, so the
            // copy in the immediate parent is stale
            let leaf = self.pool.leaf(src);
            let parent = self.pool.inner(leaf.node().parent());
            debug_assert_eq!(leaf.node().parent_child_idx(), parent.num_children() - 1);
            parent.set_key(parent.node().num_vals() - 1, leaf.key(0));
        }
        Ok(())
    }

    /// Tops up a freshly appended rightmost leaf from its left sibling so
    /// the minimum-occupancy rule keeps holding.
    pub(crate) fn fill_incomplete_tail_leaf(&mut self, slot: NodeSlot) -> bool {
        let leaf = self.pool.leaf(slot);
        let n = leaf.node().num_vals();
        if n >= Self::LEAF_MIN {
            return false;
        }

        let missing = Self::LEAF_MIN - n;
        let left_slot = leaf.node().left();
        debug_assert!(!left_slot.is_null());
        let left = self.pool.leaf(left_slot);
        let ln = left.node().num_vals();
        debug_assert!(ln + n >= 2 * Self::LEAF_MIN);

        if n > 0 {
            leaf.move_keys_within(0, n, missing);
        }
        leaf.copy_keys_from(left, ln - missing, 0, missing);
        leaf.node().set_num_vals(n + missing);
        left.node().set_num_vals(ln - missing);
        true
    }

    /// Incremental merge of the sorted staged chain into a non-empty tree.
    fn bulk_merge_staged(&mut self, chain: &StagedChain) -> Result<usize> {
        let total = chain.total;
        let mut consumed_leaves = 0usize;
        let mut p = 0usize;
        let mut inserted = 0usize;
        let mut scratch: Vec<K> = Vec::with_capacity(Self::LEAF_MAX);

        let first_key = self.staged_get(chain, 0);
        let start = self.find_nodes_for(&first_key);
        let mut tgt = start.leaf;
        let mut tgt_pos = start.pos;

        let mut appended = false;

        loop {
            // return fully consumed staged leaves to the pool
            while consumed_leaves < chain.slots.len()
                && p >= (consumed_leaves + 1) * Self::LEAF_MAX
            {
                self.pool.free_node(chain.slots[consumed_leaves]);
                consumed_leaves += 1;
            }
            if p >= total {
                break;
            }

            let src_slot = chain.slots[p / Self::LEAF_MAX];
            let src_off = p % Self::LEAF_MAX;

            if UNIQUE && tgt_pos.exact {
                p += 1;
                if p >= total {
                    continue;
                }
                let next_key = self.staged_get(chain, p);
                let (t, fp) = self.find_next(tgt, tgt_pos.pos, &next_key);
                tgt = t;
                tgt_pos = fp;
                continue;
            }

            let tgt_leaf = self.pool.leaf(tgt);
            if tgt_pos.pos == tgt_leaf.node().num_vals()
                && tgt_leaf.node().right().is_null()
                && total - p > Self::LEAF_MAX - tgt_leaf.node().num_vals()
            {
                // the rest of the input is beyond every existing key and
                // does not fit into the rightmost leaf: splice the
                // remaining staged leaves in wholesale
                let src = self.pool.leaf(src_slot);
                src.drop_key_prefix(src_off);
                self.link(tgt, src_slot);
                self.fill_incomplete_tail_leaf(src_slot);
                self.append_chain_at_end(src_slot, tgt)?;
                inserted += total - p;
                appended = true;
                break;
            }

            scratch.clear();
            scratch.extend_from_slice(&self.pool.leaf(src_slot).keys()[src_off..]);
            let (ins, used, next_tgt, next_off) =
                self.merge_run_into_leaf(&scratch, tgt, tgt_pos.pos)?;
            inserted += ins;
            p += used;

            if p >= total {
                continue;
            }
            let next_key = self.staged_get(chain, p);
            let (t, fp) = self.find_next(next_tgt, next_off, &next_key);
            tgt = t;
            tgt_pos = fp;
        }

        if !appended {
            for &slot in &chain.slots[consumed_leaves..] {
                self.pool.free_node(slot);
            }
        }

        self.pool
            .set_value_count(self.pool.value_count() + inserted as u64);
        Ok(inserted)
    }

    /// Hooks an already linked-and-filled chain of parentless leaves into
    /// the tree structure after the rightmost leaf `tgt`.
    fn append_chain_at_end(&mut self, first_new: NodeSlot, tgt: NodeSlot) -> Result<()> {
        if self.pool.depth() == 1 {
            // the root is a leaf: build the first inner level
            let separator = self.pool.leaf(first_new).key(0);
            self.new_root(tgt, first_new, separator)?;
            self.pool.set_last_leaf(first_new);
            let next = self.pool.node(first_new).right();
            if !next.is_null() {
                let root = self.pool.root();
                self.bulk_append(
                    next,
                    InsertPos {
                        node: root,
                        next_offset: 1,
                    },
                )?;
            }
            return Ok(());
        }

        let tgt_node = self.pool.node(tgt);
        let parent = tgt_node.parent();
        let parent_pos = tgt_node.parent_child_idx();
        self.bulk_append(
            first_new,
            InsertPos {
                node: parent,
                next_offset: parent_pos,
            },
        )
    }

    /// Splices as many keys of `run` as fit into the target leaf without
    /// breaking the ordering against its right neighbour. Returns
    /// `(inserted, consumed, target, next_target_offset)`.
    fn merge_run_into_leaf(
        &mut self,
        run: &[K],
        tgt_slot: NodeSlot,
        tgt_off: usize,
    ) -> Result<(usize, usize, NodeSlot, usize)> {
        debug_assert!(!run.is_empty());

        let tgt = self.pool.leaf(tgt_slot);
        let n = tgt.node().num_vals();
        debug_assert!(tgt_off <= n);
        let available = Self::LEAF_MAX - n;

        if tgt_off == 0 && self.comp.less(&run[0], &tgt.key(0)) {
            // the incoming key becomes the subtree's new smallest
            self.update_separator(tgt_slot, run[0]);
        }

        if available == 0 {
            if UNIQUE && tgt_off < n && self.comp.eq(&tgt.key(tgt_off), &run[0]) {
                return Ok((0, 1, tgt_slot, tgt_off));
            }

            self.ensure_split_capacity(tgt_slot)?;
            let ip = self.insert_into_leaf(tgt_slot, tgt_off, run[0])?;
            let landed = self.pool.leaf(ip.node);
            let next_off = ip.next_offset.min(landed.node().num_vals());
            return Ok((1, 1, ip.node, next_off));
        }

        let mut copy_len = run.len().min(available);

        // an existing right neighbour caps how far the run may spill; a
        // multiset lets equivalents of the neighbour's first key through
        let right = tgt.node().right();
        if !right.is_null() {
            let right_first = self.pool.leaf(right).key(0);
            let cut = if UNIQUE {
                find_in_keys(&run[..copy_len], &right_first, &self.comp, Self::LEAF_LINEAR).pos
            } else {
                upper_bound(&run[..copy_len], &right_first, &self.comp)
            };
            debug_assert!(cut > 0);
            copy_len = copy_len.min(cut.max(1));
        }

        if tgt_off == n {
            // a plain append
            tgt.write_keys(n, &run[..copy_len]);
            tgt.node().set_num_vals(n + copy_len);
            return Ok((copy_len, copy_len, tgt_slot, n + copy_len));
        }

        // make room, then interleave the run with the displaced tail
        tgt.move_keys_within(tgt_off, n, tgt_off + copy_len);

        let mut out = tgt_off;
        let mut src_i = 0;
        let mut tail_i = tgt_off + copy_len;
        let tail_end = n + copy_len;

        while src_i < copy_len && tail_i < tail_end {
            let incoming = run[src_i];
            let stored = tgt.key(tail_i);
            if UNIQUE && self.comp.eq(&incoming, &stored) {
                src_i += 1;
                continue;
            }
            if self.comp.less(&incoming, &stored) {
                tgt.set_key(out, incoming);
                src_i += 1;
            } else {
                tgt.set_key(out, stored);
                tail_i += 1;
            }
            out += 1;
        }
        while src_i < copy_len {
            tgt.set_key(out, run[src_i]);
            src_i += 1;
            out += 1;
        }
        if tail_i < tail_end {
            if out != tail_i {
                tgt.move_keys_within(tail_i, tail_end, out);
            }
            out += tail_end - tail_i;
        }

        let inserted = out - n;
        tgt.node().set_num_vals(out);
        Ok((inserted, copy_len, tgt_slot, tgt_off + 1))
    }

    // ------------------------------------------------------------------
    // bulk erase

    fn remove_sorted_impl(&mut self, keys: &[K], exact: bool) -> usize {
        if keys.is_empty() || self.is_empty() {
            return 0;
        }
        assert!(!self.is_read_only(), "tree is read-only");
        debug_assert!(self.input_is_sorted(keys));

        let mut removed_total = 0usize;
        let mut ki = 0usize;
        // manual continuation into the next leaf, used when an
        // equivalence run spans leaves without yielding a removal
        let mut pending: Option<(NodeSlot, usize)> = None;

        while ki < keys.len() && !self.is_empty() {
            let (slot, start) = match pending.take() {
                Some(position) => position,
                None => {
                    let loc = self.find_nodes_for(&keys[ki]);
                    (loc.leaf, loc.pos.pos)
                }
            };

            let leaf = self.pool.leaf(slot);
            let n = leaf.node().num_vals();
            let start = start.min(n);
            let old_first = leaf.key(0);

            // two-pointer pass: batch every removal in this leaf
            let ki_before = ki;
            let mut write = start;
            let mut read = start;
            let mut removed_here = 0usize;
            while read < n && ki < keys.len() {
                let stored = leaf.key(read);
                let probe = &keys[ki];
                if self.comp.less(&stored, probe) {
                    if write != read {
                        leaf.set_key(write, stored);
                    }
                    read += 1;
                    write += 1;
                } else if self.comp.less(probe, &stored) {
                    ki += 1;
                } else if exact
                    && bytemuck::bytes_of(&stored) != bytemuck::bytes_of(probe)
                {
                    // equivalent but not the named entry: keep looking
                    if write != read {
                        leaf.set_key(write, stored);
                    }
                    read += 1;
                    write += 1;
                } else {
                    read += 1;
                    ki += 1;
                    removed_here += 1;
                }
            }

            if removed_here == 0 {
                if ki > ki_before || ki >= keys.len() {
                    continue;
                }
                // keys[ki] orders beyond every key of this leaf
                let right = leaf.node().right();
                if right.is_null() {
                    break;
                }
                pending = Some((right, 0));
                continue;
            }

            if read < n {
                leaf.move_keys_within(read, n, write);
            }
            let new_n = n - removed_here;
            leaf.node().set_num_vals(new_n);
            self.pool
                .set_value_count(self.pool.value_count() - removed_here as u64);
            removed_total += removed_here;

            if self.pool.depth() == 1 {
                if new_n == 0 {
                    self.free_leaf(slot);
                    self.pool.set_root(NodeSlot::NULL);
                    self.pool.set_depth(0);
                }
                continue;
            }

            if new_n > 0
                && !leaf.node().left().is_null()
                && bytemuck::bytes_of(&leaf.key(0)) != bytemuck::bytes_of(&old_first)
            {
                let new_first = leaf.key(0);
                self.update_separator(slot, new_first);
            }

            if new_n < Self::LEAF_MIN {
                self.handle_leaf_underflow(slot);
            }
        }

        removed_total
    }

    fn input_is_sorted(&self, keys: &[K]) -> bool {
        keys.windows(2).all(|pair| self.comp.leq(&pair[0], &pair[1]))
    }

    fn advance_source(
        pool: &super::pool::NodePool<K>,
        mut slot: NodeSlot,
        mut offset: usize,
    ) -> (NodeSlot, usize) {
        loop {
            let leaf = pool.leaf(slot);
            if offset < leaf.node().num_vals() {
                return (slot, offset);
            }
            let right = leaf.node().right();
            debug_assert!(!right.is_null());
            slot = right;
            offset = 0;
        }
    }
}
