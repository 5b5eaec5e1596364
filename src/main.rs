use std::sync::Arc;

use burrow::buffer::BufferPoolManager;
use burrow::common::{PageId, RecordId, SlotId, StorageConfig};
use burrow::index::{BPlusTree, I64Comparator};
use burrow::storage::disk::DiskManager;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("Burrow - storage engine core demo");
    println!("=================================\n");

    let db_path = "demo.db";
    let disk_manager = Arc::new(DiskManager::new(db_path).expect("Failed to create disk manager"));
    println!("Created disk manager for: {}", db_path);

    let config = StorageConfig {
        buffer_pool_capacity: 16,
        ..Default::default()
    };
    let bpm = Arc::new(BufferPoolManager::new(&config, disk_manager));
    println!("Created buffer pool with {} frames\n", bpm.size());

    let tree = BPlusTree::new(Arc::clone(&bpm), Arc::new(I64Comparator), 8, 8);

    for key in [42i64, 7, -3, 100, 55, 13, -40, 0] {
        let rid = RecordId::new(PageId::new(0), SlotId::new(key.unsigned_abs() as u16));
        tree.insert(key, rid);
        println!("Inserted key {} -> {}", key, rid);
    }

    println!("\nPoint lookups:");
    for key in [42i64, -3, 999] {
        match tree.get_value(key).first() {
            Some(rid) => println!("  {} -> {}", key, rid),
            None => println!("  {} -> (not found)", key),
        }
    }

    println!("\nFull scan in key order:");
    for (key, rid) in tree.iter() {
        println!("  {} -> {}", key, rid);
    }

    tree.remove(7);
    tree.remove(-40);
    println!("\nAfter removing 7 and -40:");
    for (key, rid) in tree.iter() {
        println!("  {} -> {}", key, rid);
    }

    bpm.flush_all_pages();
    println!("\nFlushed all pages to disk");

    std::fs::remove_file(db_path).ok();
    println!("Demo completed successfully!");
}
