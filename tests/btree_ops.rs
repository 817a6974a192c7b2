//! End-to-end tree behavior: bulk loads, scans, deletes, structural
//! modifications, size limits, and fragmented values.

use std::sync::Arc;

use burrowdb::storage::MemPageStore;
use burrowdb::{Database, Error, Tree};

fn db(page_size: usize) -> Arc<Database> {
    let _ = env_logger::builder().is_test(true).try_init();
    Database::builder()
        .page_size(page_size)
        .cache_size(128)
        .open_memory()
        .unwrap()
}

fn scan_keys(tree: &Arc<Tree>) -> Vec<Vec<u8>> {
    let mut cursor = tree.cursor().unwrap();
    let mut keys = Vec::new();
    if cursor.first().unwrap() {
        keys.push(cursor.key().unwrap());
        while let Some((key, _value)) = cursor.next().unwrap() {
            keys.push(key);
        }
    }
    keys
}

#[test]
fn ascending_bulk_load_scans_in_order() {
    let db = db(4096);
    let tree = db.create_tree().unwrap();

    let value = vec![0x42u8; 100];
    for i in 0..1000 {
        let key = format!("k{:03}", i);
        tree.store(None, key.as_bytes(), &value).unwrap();
    }

    let keys = scan_keys(&tree);
    assert_eq!(keys.len(), 1000);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(key, format!("k{:03}", i).as_bytes());
    }

    tree.verify().unwrap();
}

#[test]
fn descending_bulk_load_matches_ascending() {
    let db = db(4096);
    let tree = db.create_tree().unwrap();

    let value = vec![0x42u8; 100];
    for i in (0..1000).rev() {
        let key = format!("k{:03}", i);
        tree.store(None, key.as_bytes(), &value).unwrap();
    }

    let keys = scan_keys(&tree);
    assert_eq!(keys.len(), 1000);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(key, format!("k{:03}", i).as_bytes());
    }

    tree.verify().unwrap();
}

#[test]
fn reverse_scan_mirrors_forward_scan() {
    let db = db(4096);
    let tree = db.create_tree().unwrap();

    for i in 0..300 {
        let key = format!("k{:03}", i);
        tree.store(None, key.as_bytes(), b"v").unwrap();
    }

    let mut cursor = tree.cursor().unwrap();
    assert!(cursor.last().unwrap());
    let mut keys = vec![cursor.key().unwrap()];
    while let Some((key, _)) = cursor.previous().unwrap() {
        keys.push(key);
    }
    keys.reverse();

    assert_eq!(keys, scan_keys(&tree));
}

#[test]
fn interleaved_delete_and_reinsert() {
    let db = db(4096);
    let tree = db.create_tree().unwrap();

    for i in 0..100 {
        let key = format!("k{:03}", i);
        tree.store(None, key.as_bytes(), b"original").unwrap();
    }
    for i in (0..100).step_by(2) {
        let key = format!("k{:03}", i);
        assert!(tree.delete(None, key.as_bytes()).unwrap());
    }
    for i in (1..100).step_by(2) {
        let key = format!("k{:03}", i);
        tree.store(None, key.as_bytes(), format!("first{}", i).as_bytes())
            .unwrap();
        tree.store(None, key.as_bytes(), format!("second{}", i).as_bytes())
            .unwrap();
    }

    for i in 0..100 {
        let key = format!("k{:03}", i);
        let found = tree.load(None, key.as_bytes()).unwrap();
        if i % 2 == 0 {
            assert_eq!(found, None, "even key {} should be gone", i);
        } else {
            assert_eq!(
                found,
                Some(format!("second{}", i).into_bytes()),
                "odd key {} should have the newest value",
                i
            );
        }
    }

    tree.verify().unwrap();
}

#[test]
fn insert_replace_exchange_semantics() {
    let db = db(4096);
    let tree = db.create_tree().unwrap();

    assert!(tree.insert(None, b"k", b"v1").unwrap());
    assert!(!tree.insert(None, b"k", b"v2").unwrap());
    assert_eq!(tree.load(None, b"k").unwrap(), Some(b"v1".to_vec()));

    assert!(tree.replace(None, b"k", b"v3").unwrap());
    assert!(!tree.replace(None, b"absent", b"x").unwrap());

    let old = tree.exchange(None, b"k", Some(b"v4")).unwrap();
    assert_eq!(old, Some(b"v3".to_vec()));

    assert!(tree.delete(None, b"k").unwrap());
    assert!(!tree.delete(None, b"k").unwrap());
    assert_eq!(tree.load(None, b"k").unwrap(), None);
}

#[test]
fn rebalance_absorbs_insert_before_split() {
    // Build exactly two leaves by loading ascending until the first leaf
    // split, which leaves the left leaf packed and the right nearly empty.
    let store = Arc::new(MemPageStore::new(512).unwrap());
    let db = Database::builder()
        .page_size(512)
        .open(store.clone())
        .unwrap();
    let tree = db.create_tree().unwrap();

    let value = vec![7u8; 20];
    let mut i = 0;
    loop {
        let key = format!("k{:04}", i * 10);
        tree.store(None, key.as_bytes(), &value).unwrap();
        i += 1;
        // Root page + two leaf pages exist once the root has split.
        if store.live_pages() == 3 {
            break;
        }
        assert!(i < 100, "first split never happened");
    }

    // An insert into the packed left leaf must rebalance into the roomy
    // right sibling rather than allocate a third leaf.
    let pages_before = store.live_pages();
    tree.store(None, b"k00005", &value).unwrap();
    assert_eq!(
        store.live_pages(),
        pages_before,
        "expected a rebalance, but a node split allocated a page"
    );
    assert_eq!(tree.load(None, b"k00005").unwrap(), Some(value.clone()));
    tree.verify().unwrap();

    // Keep loading until both leaves fill; the next overflow has no roomy
    // sibling and must split.
    let mut j = i;
    loop {
        let key = format!("k{:04}", j * 10);
        tree.store(None, key.as_bytes(), &value).unwrap();
        j += 1;
        if store.live_pages() > pages_before {
            break;
        }
        assert!(j < 200, "second split never happened");
    }
    tree.verify().unwrap();
}

#[test]
fn root_collapse_after_deleting_everything() {
    let store = Arc::new(MemPageStore::new(512).unwrap());
    let db = Database::builder()
        .page_size(512)
        .open(store.clone())
        .unwrap();
    let tree = db.create_tree().unwrap();

    // Enough entries for a root with several leaf children.
    let value = vec![1u8; 24];
    for i in 0..80 {
        let key = format!("k{:03}", i);
        tree.store(None, key.as_bytes(), &value).unwrap();
    }
    assert!(store.live_pages() >= 4, "tree never grew multiple leaves");
    tree.verify().unwrap();

    // A cursor left open across the collapse must keep working.
    let mut cursor = tree.cursor().unwrap();
    assert!(cursor.first().unwrap());

    for i in 0..80 {
        let key = format!("k{:03}", i);
        assert!(tree.delete(None, key.as_bytes()).unwrap(), "delete {}", i);
    }

    // The tree collapsed back to a lone root leaf page.
    assert_eq!(store.live_pages(), 1, "pages were not reclaimed");
    assert_eq!(tree.load(None, b"k000").unwrap(), None);

    // The stale cursor sees an empty tree, not an error.
    assert!(!cursor.first().unwrap());
    drop(cursor);

    // And the tree is still usable.
    tree.store(None, b"again", b"yes").unwrap();
    assert_eq!(tree.load(None, b"again").unwrap(), Some(b"yes".to_vec()));
    tree.verify().unwrap();
}

#[test]
fn max_length_key_boundary() {
    let db = db(4096);
    let tree = db.create_tree().unwrap();
    let max = tree.max_key_size();

    let key = vec![3u8; max];
    tree.store(None, &key, b"fits").unwrap();
    assert_eq!(tree.load(None, &key).unwrap(), Some(b"fits".to_vec()));

    let too_big = vec![3u8; max + 1];
    let err = tree.store(None, &too_big, b"nope").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::KeyTooLarge(_))
    ));
}

#[test]
fn large_values_fragment_and_reassemble() {
    let store = Arc::new(MemPageStore::new(4096).unwrap());
    let db = Database::builder()
        .page_size(4096)
        .open(store.clone())
        .unwrap();
    let tree = db.create_tree().unwrap();

    let value: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    assert!(value.len() > tree.max_entry_size());

    tree.store(None, b"big", &value).unwrap();
    assert_eq!(tree.load(None, b"big").unwrap(), Some(value.clone()));

    let with_fragments = store.live_pages();
    assert!(tree.delete(None, b"big").unwrap());
    assert!(
        store.live_pages() < with_fragments,
        "fragment pages were not reclaimed at commit"
    );
    tree.verify().unwrap();
}

#[test]
fn updates_shrink_and_grow_values_in_place() {
    let db = db(512);
    let tree = db.create_tree().unwrap();

    tree.store(None, b"k", &vec![1u8; 60]).unwrap();
    tree.store(None, b"k", &vec![2u8; 10]).unwrap();
    assert_eq!(tree.load(None, b"k").unwrap(), Some(vec![2u8; 10]));

    tree.store(None, b"k", &vec![3u8; 120]).unwrap();
    assert_eq!(tree.load(None, b"k").unwrap(), Some(vec![3u8; 120]));

    tree.store(None, b"k", b"").unwrap();
    assert_eq!(tree.load(None, b"k").unwrap(), Some(Vec::new()));
    tree.verify().unwrap();
}

#[test]
fn randomized_workload_matches_model() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let db = db(512);
    let tree = db.create_tree().unwrap();
    let mut model = std::collections::BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..3000 {
        let key = format!("key{:03}", rng.gen_range(0..500));
        match rng.gen_range(0..10) {
            0..=5 => {
                let value = vec![rng.gen::<u8>(); rng.gen_range(0..40)];
                tree.store(None, key.as_bytes(), &value).unwrap();
                model.insert(key.into_bytes(), value);
            }
            6..=8 => {
                let expected = model.remove(key.as_bytes()).is_some();
                assert_eq!(tree.delete(None, key.as_bytes()).unwrap(), expected);
            }
            _ => {
                assert_eq!(
                    tree.load(None, key.as_bytes()).unwrap(),
                    model.get(key.as_bytes()).cloned()
                );
            }
        }
    }

    let keys = scan_keys(&tree);
    let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
    assert_eq!(keys, expected);
    tree.verify().unwrap();
}

#[test]
fn checkpoint_does_not_disturb_readers() {
    let db = db(4096);
    let tree = db.create_tree().unwrap();

    for i in 0..200 {
        tree.store(None, format!("k{:03}", i).as_bytes(), b"v").unwrap();
    }
    db.checkpoint().unwrap();

    for i in 200..400 {
        tree.store(None, format!("k{:03}", i).as_bytes(), b"v").unwrap();
    }
    db.checkpoint().unwrap();

    assert_eq!(scan_keys(&tree).len(), 400);
    tree.verify().unwrap();
}

#[test]
fn eviction_under_tiny_cache_keeps_data_readable() {
    // A cache near the minimum forces steady eviction and re-faulting.
    let db = Database::builder()
        .page_size(512)
        .cache_size(16)
        .open_memory()
        .unwrap();
    let tree = db.create_tree().unwrap();

    let value = vec![9u8; 24];
    for i in 0..400 {
        tree.store(None, format!("k{:04}", i).as_bytes(), &value).unwrap();
    }
    for i in 0..400 {
        assert_eq!(
            tree.load(None, format!("k{:04}", i).as_bytes()).unwrap(),
            Some(value.clone()),
            "key {} lost after eviction",
            i
        );
    }
    assert_eq!(scan_keys(&tree).len(), 400);
    tree.verify().unwrap();
}

#[test]
fn find_nearby_matches_plain_find() {
    let db = db(4096);
    let tree = db.create_tree().unwrap();

    for i in 0..500 {
        tree.store(None, format!("k{:03}", i).as_bytes(), format!("v{}", i).as_bytes())
            .unwrap();
    }

    // Clustered access: each probe lands near the previous one.
    let mut cursor = tree.cursor().unwrap();
    for i in 0..500 {
        let key = format!("k{:03}", i);
        assert_eq!(
            cursor.find_nearby(key.as_bytes()).unwrap(),
            Some(format!("v{}", i).into_bytes()),
            "nearby find missed {}",
            key
        );
    }

    // Misses and long jumps agree with a fresh search.
    assert_eq!(cursor.find_nearby(b"k100x").unwrap(), None);
    assert_eq!(
        cursor.find_nearby(b"k499").unwrap(),
        Some(b"v499".to_vec())
    );
    assert_eq!(cursor.find_nearby(b"a-before-all").unwrap(), None);
    assert_eq!(cursor.find_nearby(b"z-after-all").unwrap(), None);
}

#[test]
fn separate_trees_are_independent() {
    let db = db(4096);
    let a = db.create_tree().unwrap();
    let b = db.create_tree().unwrap();

    a.store(None, b"k", b"from-a").unwrap();
    b.store(None, b"k", b"from-b").unwrap();

    assert_eq!(a.load(None, b"k").unwrap(), Some(b"from-a".to_vec()));
    assert_eq!(b.load(None, b"k").unwrap(), Some(b"from-b".to_vec()));

    a.delete(None, b"k").unwrap();
    assert_eq!(b.load(None, b"k").unwrap(), Some(b"from-b".to_vec()));
}
