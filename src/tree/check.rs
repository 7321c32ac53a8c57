// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Structural self-validation, used by the test suites after every
//! mutation phase.

use super::node::NodeSlot;
use super::BpTree;
use crate::comparator::Comparator;
use bytemuck::Pod;

struct SubtreeStats<K> {
    values: u64,
    leaves: usize,
    first: K,
    last: K,
}

impl<K, C, const UNIQUE: bool> BpTree<K, C, UNIQUE>
where
    K: Pod,
    C: Comparator<K>,
{
    /// Walks the whole structure and asserts every invariant: sortedness,
    /// occupancy, size consistency, the leaf chain, parent/child linkage,
    /// separator relations, iterator agreement and free-list accounting.
    ///
    /// Panics on the first violation. Intended for tests; cost is O(n).
    #[doc(hidden)]
    pub fn check_invariants(&self) {
        if !self.has_attached_storage() {
            assert_eq!(self.len(), 0);
            return;
        }

        if self.is_empty() {
            assert_eq!(self.depth(), 0, "empty tree must have depth 0");
            assert!(self.pool.root().is_null());
            assert!(self.pool.first_leaf().is_null());
            assert!(self.pool.last_leaf().is_null());
            assert!(self.iter().next().is_none(), "empty tree must not iterate");
            self.check_free_list();
            return;
        }

        let depth = self.pool.depth();
        assert!(depth >= 1);
        let root = self.pool.root();
        assert!(!root.is_null());
        assert!(self.pool.node(root).is_root());

        let stats = self.check_subtree(root, depth, 1, NodeSlot::NULL, 0);
        assert_eq!(
            stats.values,
            self.pool.value_count(),
            "stored size must equal the sum of leaf occupancies"
        );

        self.check_leaf_chain(stats.leaves);
        self.check_iteration();
        self.check_free_list();
    }

    fn check_subtree(
        &self,
        slot: NodeSlot,
        depth: u32,
        level: u32,
        expected_parent: NodeSlot,
        expected_idx: usize,
    ) -> SubtreeStats<K> {
        let node = self.pool.node(slot);
        assert_eq!(node.parent(), expected_parent, "parent back-link mismatch");
        if !expected_parent.is_null() {
            assert_eq!(
                node.parent_child_idx(),
                expected_idx,
                "parent_child_idx mismatch"
            );
        }

        let n = node.num_vals();
        assert!(n >= 1, "live node with no values");
        let is_root = expected_parent.is_null();

        if level == depth {
            let leaf = self.pool.leaf(slot);
            assert!(n <= Self::LEAF_MAX);
            if !is_root {
                assert!(n >= Self::LEAF_MIN, "leaf occupancy underflow");
            }
            self.assert_sorted(leaf.keys());
            return SubtreeStats {
                values: n as u64,
                leaves: 1,
                first: leaf.key(0),
                last: leaf.key(n - 1),
            };
        }

        let inner = self.pool.inner(slot);
        assert!(n <= Self::INNER_MAX);
        if !is_root {
            assert!(n >= Self::INNER_MIN, "inner occupancy underflow");
        }
        self.assert_sorted(inner.keys());

        let mut values = 0;
        let mut leaves = 0;
        let mut first = None;
        let mut previous_last = None;

        for i in 0..inner.num_children() {
            let child_stats = self.check_subtree(inner.child(i), depth, level + 1, slot, i);

            if i > 0 {
                let separator = inner.key(i - 1);
                let left_last: K = previous_last.expect("left sibling stats");
                if UNIQUE {
                    assert!(
                        self.comp.less(&left_last, &separator),
                        "separator must order after its left subtree"
                    );
                } else {
                    assert!(
                        self.comp.geq(&separator, &left_last),
                        "separator must not order before its left subtree"
                    );
                }
                assert!(
                    self.comp.leq(&separator, &child_stats.first),
                    "separator must not order after its right subtree"
                );
            }

            values += child_stats.values;
            leaves += child_stats.leaves;
            if first.is_none() {
                first = Some(child_stats.first);
            }
            previous_last = Some(child_stats.last);
        }

        SubtreeStats {
            values,
            leaves,
            first: first.expect("non-empty inner node"),
            last: previous_last.expect("non-empty inner node"),
        }
    }

    fn assert_sorted(&self, keys: &[K]) {
        for pair in keys.windows(2) {
            if UNIQUE {
                assert!(
                    self.comp.less(&pair[0], &pair[1]),
                    "node keys must be strictly sorted"
                );
            } else {
                assert!(
                    self.comp.leq(&pair[0], &pair[1]),
                    "node keys must be sorted"
                );
            }
        }
    }

    fn check_leaf_chain(&self, expected_leaves: usize) {
        let first = self.pool.first_leaf();
        assert!(!first.is_null());
        assert!(self.pool.node(first).left().is_null(), "first leaf has a left link");

        let mut slot = first;
        let mut visited = 1;
        loop {
            let right = self.pool.node(slot).right();
            if right.is_null() {
                break;
            }
            assert_eq!(
                self.pool.node(right).left(),
                slot,
                "leaf chain back-link mismatch"
            );
            slot = right;
            visited += 1;
            assert!(visited <= expected_leaves, "leaf chain longer than the tree");
        }

        assert_eq!(slot, self.pool.last_leaf(), "last leaf link mismatch");
        assert_eq!(visited, expected_leaves, "leaf chain misses leaves");
    }

    fn check_iteration(&self) {
        let mut count = 0usize;
        let mut previous: Option<K> = None;
        for key in self.iter() {
            if let Some(prev) = previous {
                if UNIQUE {
                    assert!(self.comp.less(&prev, &key), "iteration out of order");
                } else {
                    assert!(self.comp.leq(&prev, &key), "iteration out of order");
                }
            }
            previous = Some(key);
            count += 1;
        }
        assert_eq!(count, self.len(), "forward iteration count mismatch");

        let ra = self.ra_iter();
        assert_eq!(ra.len(), self.len(), "random-access length mismatch");
        let mut ra_count = 0usize;
        for (a, b) in self.ra_iter().zip(self.iter()) {
            assert_eq!(
                bytemuck::bytes_of(&a),
                bytemuck::bytes_of(&b),
                "forward and random-access traversals disagree"
            );
            ra_count += 1;
        }
        assert_eq!(ra_count, self.len());
    }

    fn check_free_list(&self) {
        let mut slot = self.pool.free_list();
        let mut count = 0u32;
        while !slot.is_null() {
            count += 1;
            assert!(
                (count as usize) <= self.pool.node_count(),
                "free list cycles or overruns the pool"
            );
            slot = self.pool.node(slot).right();
        }
        assert_eq!(count, self.pool.free_count(), "free-list count mismatch");
    }
}
