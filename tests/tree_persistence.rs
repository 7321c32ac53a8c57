use rand::seq::SliceRandom;
use rand::SeedableRng;
use test_log::test;
use vm_tree::{BpSet, Error, OpenPolicy};

const N: usize = 60_000;

#[test]
fn reopen_restores_the_tree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("numbers.bpt");

    let mut rng = rand::rngs::StdRng::seed_from_u64(0xF11E);
    let mut keys: Vec<u64> = (0..N as u64).collect();
    keys.shuffle(&mut rng);

    {
        let mut tree = BpSet::<u64>::new();
        tree.map_file(&path, OpenPolicy::CreateNew).expect("create");
        assert_eq!(tree.insert_many(&keys).expect("bulk"), N);
        tree.check_invariants();
        tree.flush_blocking().expect("flush");
    }

    {
        let mut tree = BpSet::<u64>::new();
        tree.map_file(&path, OpenPolicy::OpenExisting).expect("reopen");
        assert_eq!(tree.len(), N);
        tree.check_invariants();

        for key in &keys {
            assert!(tree.contains(key), "{key} must survive reopen");
        }
        assert!(tree.iter().eq(0..N as u64));

        assert_eq!(tree.remove(&42), 1);
        tree.flush_blocking().expect("flush");
    }

    {
        let mut tree = BpSet::<u64>::new();
        tree.map_file(&path, OpenPolicy::OpenExisting).expect("reopen");
        assert_eq!(tree.len(), N - 1);
        assert!(!tree.contains(&42));
        tree.check_invariants();

        assert!(tree.insert(42).expect("insert"));
        assert!(tree.iter().eq(0..N as u64));
    }
}

#[test]
fn read_only_tree_answers_queries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("frozen.bpt");

    {
        let mut tree = BpSet::<u32>::new();
        tree.map_file(&path, OpenPolicy::CreateNew).expect("create");
        for i in 0..5000 {
            tree.insert(i).expect("insert");
        }
        tree.flush_blocking().expect("flush");
    }

    let mut tree = BpSet::<u32>::new();
    tree.map_file_read_only(&path).expect("reopen");
    assert!(tree.is_read_only());
    assert_eq!(tree.len(), 5000);
    assert!(tree.contains(&1234));
    assert_eq!(tree.iter().count(), 5000);
    tree.check_invariants();

    assert!(matches!(tree.insert(9999), Err(Error::ReadOnly)));
    assert_eq!(tree.len(), 5000);
}

#[test]
fn open_policies() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("policy.bpt");

    let mut tree = BpSet::<u32>::new();
    assert!(tree.map_file(&path, OpenPolicy::OpenExisting).is_err());

    tree.map_file(&path, OpenPolicy::OpenOrCreate).expect("create");
    tree.insert(1).expect("insert");
    tree.flush_blocking().expect("flush");
    drop(tree);

    let mut tree = BpSet::<u32>::new();
    assert!(tree.map_file(&path, OpenPolicy::CreateNew).is_err());

    tree.map_file(&path, OpenPolicy::OpenOrCreate).expect("open");
    assert_eq!(tree.len(), 1);
    drop(tree);

    // truncating policies discard the contents
    let mut tree = BpSet::<u32>::new();
    tree.map_file(&path, OpenPolicy::CreateNewOrTruncateExisting)
        .expect("truncate");
    assert!(tree.is_empty());
}

#[test]
fn persisted_file_is_position_independent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let original = dir.path().join("original.bpt");
    let copy = dir.path().join("copy.bpt");

    {
        let mut tree = BpSet::<u64>::new();
        tree.map_file(&original, OpenPolicy::CreateNew).expect("create");
        for i in 0..10_000 {
            tree.insert(i * 7).expect("insert");
        }
        tree.flush_blocking().expect("flush");
    }

    // a raw byte copy of the file reproduces the tree exactly
    std::fs::copy(&original, &copy).expect("copy");

    let mut tree = BpSet::<u64>::new();
    tree.map_file(&copy, OpenPolicy::OpenExisting).expect("open copy");
    assert_eq!(tree.len(), 10_000);
    assert!(tree.iter().eq((0..10_000).map(|i| i * 7)));
    tree.check_invariants();
}

#[test]
fn anonymous_trees_do_not_persist() {
    let mut tree = BpSet::<u32>::new();
    tree.map_memory(100).expect("map");
    tree.insert(1).expect("insert");
    assert!(tree.has_attached_storage());

    // flushing an anonymous mapping is a harmless no-op
    tree.flush_async().expect("flush");
    tree.flush_blocking().expect("flush");
}
