use rand::seq::SliceRandom;
use rand::SeedableRng;
use test_log::test;
use vm_tree::BpSet;

const K: u64 = 30_000;

#[test]
fn merge_even_and_odd_trees() {
    let mut a = BpSet::<u64>::new();
    let mut b = BpSet::<u64>::new();

    let evens: Vec<u64> = (0..K).map(|i| i * 2).collect();
    let odds: Vec<u64> = (0..K).map(|i| i * 2 + 1).collect();
    a.insert_presorted(&evens).expect("bulk");
    b.insert_presorted(&odds).expect("bulk");

    assert_eq!(a.merge_from(&mut b).expect("merge"), K as usize);
    assert_eq!(a.len(), 2 * K as usize);
    assert!(a.iter().eq(0..2 * K));
    assert!(b.is_empty());

    a.check_invariants();
    b.check_invariants();
}

#[test]
fn merge_into_empty_swaps_storage() {
    let mut a = BpSet::<u32>::new();
    let mut b = BpSet::<u32>::new();
    for i in 0..1000 {
        b.insert(i).expect("insert");
    }

    assert_eq!(a.merge_from(&mut b).expect("merge"), 1000);
    assert_eq!(a.len(), 1000);
    assert!(b.is_empty());
    a.check_invariants();
}

#[test]
fn merge_with_trailing_appendix() {
    // an appendix beyond every key of the target exercises the merge's
    // bulk-append finish, which must copy (not transplant) source leaves
    let mut rng = rand::rngs::StdRng::seed_from_u64(77);

    let mut a = BpSet::<u64>::new();
    let mut b = BpSet::<u64>::new();

    for i in 0..K {
        a.insert(i * 2).expect("insert");
    }

    let mut b_keys: Vec<u64> = (0..K).map(|i| i * 2 + 1).collect();
    b_keys.extend(2 * K..2 * K + K / 5);
    b_keys.shuffle(&mut rng);
    assert_eq!(b.insert_many(&b_keys).expect("bulk"), b_keys.len());

    assert_eq!(a.merge_from(&mut b).expect("merge"), b_keys.len());
    assert!(a.iter().eq(0..2 * K + K / 5));
    a.check_invariants();
}

#[test]
fn merge_skips_duplicates_in_unique_trees() {
    let mut a = BpSet::<u32>::new();
    let mut b = BpSet::<u32>::new();

    for i in 0..1000 {
        a.insert(i).expect("insert");
    }
    for i in 500..1500 {
        b.insert(i).expect("insert");
    }

    assert_eq!(a.merge_from(&mut b).expect("merge"), 500);
    assert_eq!(a.len(), 1500);
    assert!(a.iter().eq(0..1500));
    a.check_invariants();
}

#[test]
fn merge_empty_source_is_a_noop() {
    let mut a = BpSet::<u32>::new();
    let mut b = BpSet::<u32>::new();
    a.insert(1).expect("insert");

    assert_eq!(a.merge_from(&mut b).expect("merge"), 0);
    assert_eq!(a.len(), 1);
}

#[test]
fn merge_then_erase_everything() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(3);

    let mut a = BpSet::<u64>::new();
    let mut b = BpSet::<u64>::new();
    for i in 0..K {
        a.insert(i * 2).expect("insert");
        b.insert(i * 2 + 1).expect("insert");
    }
    a.merge_from(&mut b).expect("merge");

    let mut order: Vec<u64> = (0..2 * K).collect();
    order.shuffle(&mut rng);
    for key in &order {
        assert_eq!(a.remove(key), 1);
    }
    assert!(a.is_empty());
    a.check_invariants();
}
