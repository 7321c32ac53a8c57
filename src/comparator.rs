// Copyright (c) 2024-present, vm-tree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Strict-weak ordering over stored keys.
///
/// Only [`Comparator::less`] is required; equality and the non-strict
/// comparisons are derived from two strict-less calls unless the
/// implementation provides cheaper overrides. Everything is resolved
/// statically, there is no dynamic dispatch on the lookup paths.
pub trait Comparator<K> {
    /// Marks comparators that are plain orderings over the key's own bytes
    /// (no indirection, no external state). Such comparators allow the
    /// node-local search to use a linear scan for small keys.
    const IS_SIMPLE: bool = false;

    /// Returns whether `a` orders strictly before `b`.
    fn less(&self, a: &K, b: &K) -> bool;

    /// Returns whether `a` and `b` are equivalent under the ordering.
    fn eq(&self, a: &K, b: &K) -> bool {
        !self.less(a, b) && !self.less(b, a)
    }

    /// `a` ≤ `b` under the ordering.
    fn leq(&self, a: &K, b: &K) -> bool {
        !self.less(b, a)
    }

    /// `a` ≥ `b` under the ordering.
    fn geq(&self, a: &K, b: &K) -> bool {
        !self.less(a, b)
    }
}

/// The key's own `Ord`, the default for sets of plain keys.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    const IS_SIMPLE: bool = true;

    #[inline]
    fn less(&self, a: &K, b: &K) -> bool {
        a < b
    }

    #[inline]
    fn eq(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::{Comparator, NaturalOrder};
    use test_log::test;

    #[test]
    fn derived_relations() {
        struct ByRem;

        impl Comparator<u32> for ByRem {
            fn less(&self, a: &u32, b: &u32) -> bool {
                (a % 10) < (b % 10)
            }
        }

        let c = ByRem;
        assert!(c.less(&21, &13));
        assert!(c.eq(&3, &13));
        assert!(c.leq(&3, &13));
        assert!(c.geq(&13, &3));
        assert!(!c.eq(&4, &13));
    }

    #[test]
    fn natural_order_is_simple() {
        assert!(<NaturalOrder as Comparator<u64>>::IS_SIMPLE);
        let c = NaturalOrder;
        assert!(c.less(&1u64, &2u64));
        assert!(Comparator::<u64>::eq(&c, &7, &7));
    }
}
