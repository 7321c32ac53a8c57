use test_log::test;
use vm_tree::BpSet;

const N: u64 = 40_000;

#[test]
fn interleaved_presorted_halves() {
    let mut tree = BpSet::<u64>::new();

    let evens: Vec<u64> = (0..N).map(|i| i * 2).collect();
    let odds: Vec<u64> = (0..N).map(|i| i * 2 + 1).collect();

    assert_eq!(tree.insert_presorted(&evens).expect("bulk"), evens.len());
    tree.check_invariants();

    assert_eq!(tree.insert_presorted(&odds).expect("bulk"), odds.len());
    tree.check_invariants();

    assert_eq!(tree.len(), 2 * N as usize);
    assert!(tree.iter().eq(0..2 * N));
}

#[test]
fn interleaved_unsorted_halves() {
    let mut tree = BpSet::<u64>::new();

    // reversed input exercises the staged in-place sort
    let mut evens: Vec<u64> = (0..N).map(|i| i * 2).collect();
    let mut odds: Vec<u64> = (0..N).map(|i| i * 2 + 1).collect();
    evens.reverse();
    odds.reverse();

    assert_eq!(tree.insert_many(&evens).expect("bulk"), evens.len());
    assert_eq!(tree.insert_many(&odds).expect("bulk"), odds.len());

    tree.check_invariants();
    assert!(tree.iter().eq(0..2 * N));
}

#[test]
fn singles_then_bulk_then_singles() {
    let mut tree = BpSet::<u64>::new();

    let third = N / 3;
    for i in 0..third {
        assert!(tree.insert(i).expect("insert"));
    }

    let middle: Vec<u64> = (third..2 * third).collect();
    assert_eq!(tree.insert_presorted(&middle).expect("bulk"), middle.len());

    for i in 2 * third..N {
        assert!(tree.insert(i).expect("insert"));
    }

    tree.check_invariants();
    assert!(tree.iter().eq(0..N));
}
