use test_log::test;
use vm_tree::{BpMultiSet, BpSet};

type Tree = BpSet<u64>;
const MAX_PER_LEAF: usize = Tree::MAX_LEAF_VALUES;

#[test]
fn bulk_boundary_sizes() {
    for count in [
        1,
        MAX_PER_LEAF - 1,
        MAX_PER_LEAF,
        MAX_PER_LEAF + 1,
        3 * MAX_PER_LEAF + MAX_PER_LEAF / 2,
    ] {
        let keys: Vec<u64> = (0..count as u64).collect();
        let mut tree = Tree::new();
        assert_eq!(tree.insert_presorted(&keys).expect("bulk"), count);
        assert_eq!(tree.len(), count);
        assert!(tree.iter().eq(0..count as u64));
        tree.check_invariants();
    }
}

#[test]
fn bulk_empty_range_is_a_noop() {
    let mut tree = Tree::new();
    assert_eq!(tree.insert_many(&[]).expect("bulk"), 0);
    assert!(tree.is_empty());

    tree.insert(1).expect("insert");
    assert_eq!(tree.insert_presorted(&[]).expect("bulk"), 0);
    assert_eq!(tree.len(), 1);
}

#[test]
fn bulk_duplicates_against_existing_tree() {
    let mut tree = Tree::new();
    let keys: Vec<u64> = (0..2000).collect();
    tree.insert_presorted(&keys).expect("bulk");

    // re-inserting the same values inserts nothing
    assert_eq!(tree.insert_many(&keys).expect("bulk"), 0);
    assert_eq!(tree.len(), keys.len());

    // one fresh value among the duplicates
    let mut copies = keys.clone();
    copies[1000] = 5000;
    assert_eq!(tree.insert_many(&copies).expect("bulk"), 1);
    assert!(tree.contains(&5000));
    assert_eq!(tree.remove(&5000), 1);
    tree.check_invariants();
}

#[test]
fn bulk_duplicates_within_the_input() {
    let mut tree = Tree::new();
    let keys = [3u64, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5];
    assert_eq!(tree.insert_many(&keys).expect("bulk"), 7);
    assert!(tree.iter().eq([1, 2, 3, 4, 5, 6, 9]));
    tree.check_invariants();
}

#[test]
fn multiset_bulk_keeps_duplicates() {
    let mut tree = BpMultiSet::<u64>::new();
    let keys = [3u64, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5];
    assert_eq!(tree.insert_many(&keys).expect("bulk"), keys.len());
    assert!(tree.iter().eq([1, 1, 2, 3, 3, 4, 5, 5, 5, 6, 9]));
    tree.check_invariants();
}

#[test]
fn bulk_merge_at_node_boundary() {
    // fill one leaf exactly with even keys, then interleave odd keys: the
    // merge fills the node to capacity and must continue into the split
    let mut tree = Tree::new();

    let evens: Vec<u64> = (0..MAX_PER_LEAF as u64).map(|i| i * 2).collect();
    assert_eq!(tree.insert_presorted(&evens).expect("bulk"), evens.len());

    let odds: Vec<u64> = (0..MAX_PER_LEAF as u64).map(|i| i * 2 + 1).collect();
    assert_eq!(tree.insert_presorted(&odds).expect("bulk"), odds.len());

    tree.check_invariants();
    assert!(tree.iter().eq(0..2 * MAX_PER_LEAF as u64));
}

#[test]
fn bulk_insert_triggers_multiple_splits() {
    let mut tree = Tree::new();
    let total = (MAX_PER_LEAF * 5) as u64;

    let first: Vec<u64> = (0..total).step_by(3).collect();
    assert_eq!(tree.insert_presorted(&first).expect("bulk"), first.len());

    let second: Vec<u64> = (0..total).filter(|i| i % 3 != 0).collect();
    assert_eq!(tree.insert_presorted(&second).expect("bulk"), second.len());

    assert_eq!(tree.len(), total as usize);
    tree.check_invariants();
    assert!(tree.iter().eq(0..total));
}

#[test]
fn bulk_append_keeps_tail_occupancy() {
    // leave the largest chunk of the input for the end so the rightmost
    // append path gets exercised, including its tail top-up
    let mut tree = Tree::new();
    let keys: Vec<u64> = (0..(MAX_PER_LEAF * 4) as u64).collect();
    tree.insert_presorted(&keys).expect("bulk");

    let appendix: Vec<u64> =
        ((MAX_PER_LEAF * 4) as u64..(MAX_PER_LEAF * 7 + 3) as u64).collect();
    assert_eq!(
        tree.insert_presorted(&appendix).expect("bulk"),
        appendix.len()
    );

    tree.check_invariants();
    assert!(tree.iter().eq(0..(MAX_PER_LEAF * 7 + 3) as u64));
}

#[test]
fn small_tail_append_goes_through_the_leaf() {
    // a tiny beyond-everything batch must not create an undersized leaf
    let mut tree = Tree::new();
    tree.insert(10).expect("insert");

    assert_eq!(tree.insert_presorted(&[20, 30]).expect("bulk"), 2);
    assert!(tree.iter().eq([10, 20, 30]));
    tree.check_invariants();
}
