//! Concurrency tests for the B+ tree: crabbing safety under parallel
//! writers and readers.

use std::sync::Arc;
use std::thread;

use burrow::buffer::BufferPoolManager;
use burrow::common::{PageId, RecordId, SlotId, StorageConfig};
use burrow::index::{BPlusTree, I64Comparator};
use burrow::storage::disk::DiskManager;

use tempfile::NamedTempFile;

fn create_tree(pool_size: usize, leaf_max: usize, internal_max: usize) -> (Arc<BPlusTree>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let disk_manager = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let config = StorageConfig {
        buffer_pool_capacity: pool_size,
        ..Default::default()
    };
    let bpm = Arc::new(BufferPoolManager::new(&config, disk_manager));
    let tree = Arc::new(BPlusTree::new(
        bpm,
        Arc::new(I64Comparator),
        leaf_max,
        internal_max,
    ));
    (tree, temp_file)
}

fn rid_for(key: i64) -> RecordId {
    RecordId::new(PageId::new(key as u32), SlotId::new(0))
}

#[test]
fn test_concurrent_disjoint_inserts() {
    let (tree, _temp) = create_tree(128, 4, 4);

    const THREADS: i64 = 4;
    const PER_THREAD: i64 = 250;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let base = t * PER_THREAD;
                for key in base..base + PER_THREAD {
                    assert!(tree.insert(key, rid_for(key)), "insert {}", key);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // The final tree holds exactly the union of the disjoint ranges.
    for key in 0..THREADS * PER_THREAD {
        assert_eq!(tree.get_value(key), vec![rid_for(key)], "key {}", key);
    }

    let keys: Vec<i64> = tree.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_interleaved_inserts() {
    let (tree, _temp) = create_tree(128, 4, 4);

    const THREADS: i64 = 4;
    const TOTAL: i64 = 1000;

    // Stripe keys across threads so neighboring keys race on the same
    // leaves.
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let mut key = t;
                while key < TOTAL {
                    assert!(tree.insert(key, rid_for(key)));
                    key += THREADS;
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let keys: Vec<i64> = tree.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, (0..TOTAL).collect::<Vec<_>>());
}

#[test]
fn test_readers_never_observe_partial_splits() {
    let (tree, _temp) = create_tree(128, 4, 4);

    const TOTAL: i64 = 800;

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for key in 0..TOTAL {
                assert!(tree.insert(key, rid_for(key)));
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for _ in 0..40 {
                    // A scan taken at any moment sees each key at most once,
                    // in strictly ascending order.
                    let snapshot: Vec<i64> = tree.iter().map(|(k, _)| k).collect();
                    for pair in snapshot.windows(2) {
                        assert!(
                            pair[0] < pair[1],
                            "scan out of order or duplicated: {} then {}",
                            pair[0],
                            pair[1]
                        );
                    }
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(tree.iter().count(), TOTAL as usize);
}

#[test]
fn test_concurrent_point_lookups_during_inserts() {
    let (tree, _temp) = create_tree(128, 4, 4);

    const TOTAL: i64 = 600;

    // Seed the lower half; the writer adds the upper half while readers
    // hammer the seeded keys.
    for key in 0..TOTAL / 2 {
        tree.insert(key, rid_for(key));
    }

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for key in TOTAL / 2..TOTAL {
                assert!(tree.insert(key, rid_for(key)));
            }
        })
    };

    let readers: Vec<_> = (0..3)
        .map(|r| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                for round in 0..200 {
                    let key = (r * 31 + round * 7) % (TOTAL / 2);
                    assert_eq!(
                        tree.get_value(key),
                        vec![rid_for(key)],
                        "seeded key {} disappeared mid-insert",
                        key
                    );
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn test_concurrent_removes_on_disjoint_ranges() {
    let (tree, _temp) = create_tree(128, 4, 4);

    const THREADS: i64 = 4;
    const PER_THREAD: i64 = 150;
    const TOTAL: i64 = THREADS * PER_THREAD;

    for key in 0..TOTAL {
        tree.insert(key, rid_for(key));
    }

    // Each thread clears the even keys of its own range.
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let base = t * PER_THREAD;
                for key in (base..base + PER_THREAD).filter(|k| k % 2 == 0) {
                    tree.remove(key);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    for key in 0..TOTAL {
        if key % 2 == 0 {
            assert!(tree.get_value(key).is_empty(), "key {} survived", key);
        } else {
            assert_eq!(tree.get_value(key), vec![rid_for(key)], "key {}", key);
        }
    }

    let keys: Vec<i64> = tree.iter().map(|(k, _)| k).collect();
    let expected: Vec<i64> = (0..TOTAL).filter(|k| k % 2 == 1).collect();
    assert_eq!(keys, expected);
}
