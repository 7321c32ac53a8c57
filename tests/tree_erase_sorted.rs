use std::cell::RefCell;
use test_log::test;
use vm_tree::{BpSet, Comparator};

type Tree = BpSet<u64>;
const MAX_PER_LEAF: usize = Tree::MAX_LEAF_VALUES;

fn filled(n: usize) -> Tree {
    let keys: Vec<u64> = (0..n as u64).collect();
    let mut tree = Tree::new();
    tree.insert_presorted(&keys).expect("bulk");
    tree
}

#[test]
fn erase_sorted_basic() {
    let mut tree = filled(10);
    assert_eq!(tree.remove_sorted(&[2, 5, 7]), 3);
    assert_eq!(tree.len(), 7);
    for k in [2u64, 5, 7] {
        assert!(!tree.contains(&k));
    }
    for k in [0u64, 1, 3, 4, 6, 8, 9] {
        assert!(tree.contains(&k));
    }
    tree.check_invariants();
}

#[test]
fn erase_sorted_empty_input() {
    let mut tree = filled(5);
    assert_eq!(tree.remove_sorted(&[]), 0);
    assert_eq!(tree.len(), 5);
}

#[test]
fn erase_sorted_empty_tree() {
    let mut tree = Tree::new();
    assert_eq!(tree.remove_sorted(&[1, 2, 3]), 0);
    assert_eq!(tree.remove_sorted_exact(&[]), 0);
}

#[test]
fn erase_sorted_all_keys() {
    let keys: Vec<u64> = (0..(MAX_PER_LEAF * 4) as u64).collect();
    let mut tree = filled(keys.len());
    assert_eq!(tree.remove_sorted(&keys), keys.len());
    assert!(tree.is_empty());
    tree.check_invariants();
}

#[test]
fn erase_sorted_nonexistent_keys() {
    let mut tree = Tree::new();
    tree.insert_presorted(&[2, 4, 6, 8, 10]).expect("bulk");
    assert_eq!(tree.remove_sorted(&[1, 3, 5]), 0);
    assert_eq!(tree.len(), 5);
}

#[test]
fn erase_sorted_mixed_existing_and_absent() {
    let mut tree = filled(10);
    // input is 1-based here: {2, 4, 6} exist, {11, 12} do not
    assert_eq!(tree.remove_sorted(&[2, 4, 6, 11, 12]), 3);
    assert_eq!(tree.len(), 7);
    assert!(!tree.contains(&2));
    assert!(tree.contains(&3));
    tree.check_invariants();
}

#[test]
fn erase_sorted_triggers_underflow() {
    let total = MAX_PER_LEAF * 3;
    let mut tree = filled(total);

    // carve a hole spanning more than a leaf minimum out of the middle
    let from = MAX_PER_LEAF as u64;
    let to = (MAX_PER_LEAF + MAX_PER_LEAF / 2 + 1) as u64;
    let hole: Vec<u64> = (from..to).collect();

    assert_eq!(tree.remove_sorted(&hole), hole.len());
    assert_eq!(tree.len(), total - hole.len());
    tree.check_invariants();

    for k in &hole {
        assert!(!tree.contains(k));
    }
    assert!(tree.contains(&(from - 1)));
    assert!(tree.contains(&to));
}

#[test]
fn erase_sorted_drains_the_first_leaf() {
    let total = MAX_PER_LEAF * 3;
    let mut tree = filled(total);

    let first_leaf: Vec<u64> = (0..MAX_PER_LEAF as u64).collect();
    assert_eq!(tree.remove_sorted(&first_leaf), first_leaf.len());
    tree.check_invariants();

    assert_eq!(tree.first(), Some(MAX_PER_LEAF as u64));
    assert_eq!(tree.len(), total - MAX_PER_LEAF);
}

#[test]
fn erase_sorted_every_fifth_key_of_a_large_tree() {
    let total = MAX_PER_LEAF * 10;
    let mut tree = filled(total);

    let victims: Vec<u64> = (0..total as u64).step_by(5).collect();
    assert_eq!(tree.remove_sorted(&victims), victims.len());

    for k in 0..total as u64 {
        assert_eq!(tree.contains(&k), k % 5 != 0);
    }
    assert_eq!(tree.len(), total - victims.len());
    tree.check_invariants();
}

// ---------------------------------------------------------------------
// exact vs. equivalence erase through an indirect comparator

thread_local! {
    static TABLE: RefCell<Vec<i64>> = const { RefCell::new(Vec::new()) };
}

/// Orders row ids by the row contents in a shared external table; distinct
/// ids can therefore compare equal.
#[derive(Clone, Copy, Debug, Default)]
struct ByTable;

impl Comparator<u32> for ByTable {
    fn less(&self, a: &u32, b: &u32) -> bool {
        TABLE.with(|table| {
            let table = table.borrow();
            table[*a as usize] < table[*b as usize]
        })
    }
}

#[test]
fn erase_sorted_exact_removes_only_the_named_row() {
    // rows 0..=5; row 5 has the same value as row 0, so the ids 0 and 5
    // compare equal even though only id 0 is stored
    TABLE.with(|table| {
        *table.borrow_mut() = vec![100, 200, 300, 400, 500, 100];
    });

    let mut tree = BpSet::<u32, ByTable>::new();
    for id in [0u32, 1, 2] {
        assert!(tree.insert(id).expect("insert"));
    }

    // exact: id 5 is not stored, nothing may happen
    assert_eq!(tree.remove_sorted_exact(&[5]), 0);
    assert_eq!(tree.len(), 3);
    assert!(tree.iter().eq([0u32, 1, 2]));

    // equivalence: id 5 finds the equivalent stored id 0 and removes it
    assert_eq!(tree.remove_sorted(&[5]), 1);
    assert_eq!(tree.len(), 2);
    assert!(tree.iter().eq([1u32, 2]));
    tree.check_invariants();
}

#[test]
fn erase_sorted_exact_finds_the_match_inside_a_run() {
    // ids 0..4 all map to the same value; the multiset stores all of them
    TABLE.with(|table| {
        *table.borrow_mut() = vec![7, 7, 7, 7, 7];
    });

    let mut tree = vm_tree::BpMultiSet::<u32, ByTable>::new();
    for id in 0u32..5 {
        tree.insert(id).expect("insert");
    }

    // only the bitwise match goes away, the equivalents stay
    assert_eq!(tree.remove_sorted_exact(&[3]), 1);
    assert_eq!(tree.len(), 4);
    assert_eq!(tree.iter().filter(|id| *id == 3).count(), 0);
    tree.check_invariants();
}
