//! Multi-threaded smoke tests: concurrent writers over disjoint ranges,
//! readers racing writers, and scans racing structural modifications.

use std::sync::Arc;

use burrowdb::Database;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn concurrent_writers_disjoint_ranges() {
    init_logging();
    let db = Database::builder()
        .page_size(512)
        .cache_size(64)
        .open_memory()
        .unwrap();
    let tree = db.create_tree().unwrap();

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let tree = Arc::clone(&tree);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("t{}k{:04}", t, i);
                    tree.store(None, key.as_bytes(), format!("v{}", i).as_bytes())
                        .unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    for t in 0..4 {
        for i in 0..200 {
            let key = format!("t{}k{:04}", t, i);
            assert_eq!(
                tree.load(None, key.as_bytes()).unwrap(),
                Some(format!("v{}", i).into_bytes()),
                "missing {}",
                key
            );
        }
    }

    let mut cursor = tree.cursor().unwrap();
    let mut count = 0;
    if cursor.first().unwrap() {
        count += 1;
        while cursor.next().unwrap().is_some() {
            count += 1;
        }
    }
    assert_eq!(count, 800);
    tree.verify().unwrap();
}

#[test]
fn readers_race_writers_without_corruption() {
    init_logging();
    let db = Database::builder()
        .page_size(512)
        .cache_size(64)
        .open_memory()
        .unwrap();
    let tree = db.create_tree().unwrap();

    for i in 0..100 {
        tree.store(None, format!("base{:03}", i).as_bytes(), b"stable")
            .unwrap();
    }

    let writer = {
        let tree = Arc::clone(&tree);
        std::thread::spawn(move || {
            for i in 0..500 {
                let key = format!("hot{:04}", i);
                tree.store(None, key.as_bytes(), &vec![i as u8; 24]).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let tree = Arc::clone(&tree);
            std::thread::spawn(move || {
                for round in 0..200 {
                    let i = round % 100;
                    let key = format!("base{:03}", i);
                    assert_eq!(
                        tree.load(None, key.as_bytes()).unwrap(),
                        Some(b"stable".to_vec()),
                        "stable key vanished mid-race"
                    );
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }

    tree.verify().unwrap();
}

#[test]
fn scans_survive_concurrent_splits() {
    init_logging();
    let db = Database::builder()
        .page_size(512)
        .cache_size(64)
        .open_memory()
        .unwrap();
    let tree = db.create_tree().unwrap();

    for i in 0..50 {
        tree.store(None, format!("s{:04}", i * 10).as_bytes(), &[1u8; 20])
            .unwrap();
    }

    let writer = {
        let tree = Arc::clone(&tree);
        std::thread::spawn(move || {
            for i in 0..300 {
                tree.store(None, format!("s{:04}", i * 3 + 1).as_bytes(), &[2u8; 20])
                    .unwrap();
            }
        })
    };

    // Scans must stay ordered even while leaves split underneath; they
    // may or may not observe the concurrent inserts.
    let scanner = {
        let tree = Arc::clone(&tree);
        std::thread::spawn(move || {
            for _ in 0..20 {
                let mut cursor = tree.cursor().unwrap();
                let mut prev: Option<Vec<u8>> = None;
                if cursor.first().unwrap() {
                    prev = cursor.key();
                    while let Some((key, _)) = cursor.next().unwrap() {
                        if let Some(p) = &prev {
                            assert!(p < &key, "scan went backwards");
                        }
                        prev = Some(key);
                    }
                }
            }
        })
    };

    writer.join().unwrap();
    scanner.join().unwrap();
    tree.verify().unwrap();
}
