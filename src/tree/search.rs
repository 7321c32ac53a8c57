// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::comparator::Comparator;

/// Node-local search result: the first position whose key does not order
/// before the probe, and whether that position holds an equivalent key.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FindPos {
    pub pos: usize,
    pub exact: bool,
}

/// Whether lookups in up-to-`max_len` sorted keys should scan linearly:
/// a plain comparator, a small key and a bounded fan-out.
pub(crate) const fn use_linear_search<K, C: Comparator<K>>(max_len: usize) -> bool {
    C::IS_SIMPLE && std::mem::size_of::<K>() < 4 * std::mem::size_of::<usize>() && max_len < 2048
}

/// Lower-bound search in a node's sorted keys.
///
/// The scan strategy is decided once per tree instantiation (see
/// [`use_linear_search`]); page-sized nodes of small plain keys sit in the
/// regime where the branch-free walk beats halving.
pub(crate) fn find_in_keys<K, C: Comparator<K>>(
    keys: &[K],
    probe: &K,
    comp: &C,
    linear: bool,
) -> FindPos {
    let pos = if linear {
        let mut at = 0;
        while at != keys.len() && comp.less(&keys[at], probe) {
            at += 1;
        }
        at
    } else {
        // halve towards the first key that does not order before the probe
        let mut lo = 0;
        let mut hi = keys.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if comp.less(&keys[mid], probe) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    };

    let exact = pos < keys.len() && !comp.less(probe, &keys[pos]);
    FindPos { pos, exact }
}

/// First position whose key orders strictly after the probe; past the
/// whole equivalence run, where [`find_in_keys`] stops in front of it.
pub(crate) fn upper_bound<K, C: Comparator<K>>(keys: &[K], probe: &K, comp: &C) -> usize {
    let mut lo = 0;
    let mut hi = keys.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if comp.less(probe, &keys[mid]) {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::NaturalOrder;
    use test_log::test;

    fn find(keys: &[i32], probe: i32) -> FindPos {
        find_in_keys(keys, &probe, &NaturalOrder, false)
    }

    #[test]
    fn lower_bound_matches_std_partition_point() {
        let keys = [1, 2, 3, 4, 5];
        for probe in 0..=6 {
            let hit = find(&keys, probe);
            assert_eq!(keys.partition_point(|&x| x < probe), hit.pos);
        }

        let empty: [i32; 0] = [];
        let hit = find_in_keys(&empty, &10, &NaturalOrder, false);
        assert_eq!(hit.pos, 0);
        assert!(!hit.exact);
    }

    #[test]
    fn lower_bound_first_last_middle() {
        let keys = [10, 20, 30, 40, 50];

        let hit = find(&keys, 10);
        assert_eq!(hit.pos, 0);
        assert!(hit.exact);

        let hit = find(&keys, 50);
        assert_eq!(hit.pos, 4);
        assert!(hit.exact);

        let miss = find(&keys, 35);
        assert_eq!(miss.pos, 3);
        assert!(!miss.exact);

        let beyond = find(&keys, 60);
        assert_eq!(beyond.pos, 5);
        assert!(!beyond.exact);
    }

    #[test]
    fn upper_bound_skips_the_equivalence_run() {
        let keys = [1, 3, 3, 3, 7];
        assert_eq!(upper_bound(&keys, &3, &NaturalOrder), 4);
        assert_eq!(upper_bound(&keys, &0, &NaturalOrder), 0);
        assert_eq!(upper_bound(&keys, &7, &NaturalOrder), 5);
        assert_eq!(upper_bound(&keys, &9, &NaturalOrder), 5);

        // lower bound stops in front of the run instead
        assert_eq!(find(&keys, 3).pos, 1);
    }

    #[test]
    fn linear_and_binary_agree() {
        let keys: Vec<u64> = (0..500).map(|i| i * 3).collect();
        for probe in 0..1501 {
            let linear = find_in_keys(&keys, &probe, &NaturalOrder, true);
            let binary = find_in_keys(&keys, &probe, &NaturalOrder, false);
            assert_eq!(linear.pos, binary.pos);
            assert_eq!(linear.exact, binary.exact);
        }
    }

    #[test]
    fn linear_dispatch_constants() {
        assert!(use_linear_search::<u32, NaturalOrder>(1020));
        assert!(!use_linear_search::<u32, NaturalOrder>(4000));
        assert!(!use_linear_search::<[u64; 8], NaturalOrder>(100));
    }
}
