//! Burrow - the storage engine core of a disk-oriented database
//!
//! This crate implements the hot path of every table access: a fixed-capacity
//! buffer pool that mediates between a paged disk file and in-memory frames,
//! and a disk-resident, concurrent B+ tree index layered on top of it.
//!
//! # Architecture
//!
//! The system is organized into three layers:
//!
//! - **Storage Layer** (`storage`): disk I/O
//!   - `DiskManager`: reads and writes pages of a flat database file
//!   - `DiskScheduler`: background workers draining per-page-ordered I/O queues
//!
//! - **Buffer Pool** (`buffer`): memory management for database pages
//!   - `BufferPoolManager`: faults pages in on demand and caches them in frames
//!   - `LruKReplacer`: LRU-K replacement policy choosing eviction victims
//!   - `FrameHeader`: per-frame metadata and page bytes
//!   - `ReadPageGuard`/`WritePageGuard`: RAII guards combining a pin with a
//!     per-frame latch
//!
//! - **Index** (`index`): an ordered multi-key index over buffer pool pages
//!   - `BPlusTree`: point lookup, range scan, insert, and delete with latch
//!     crabbing
//!   - `IndexIterator`: forward cursor over the leaf chain
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use burrow::buffer::BufferPoolManager;
//! use burrow::common::{PageId, RecordId, SlotId, StorageConfig};
//! use burrow::index::{BPlusTree, I64Comparator};
//! use burrow::storage::disk::DiskManager;
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(&StorageConfig::default(), disk_manager));
//!
//! let tree = BPlusTree::new(bpm, Arc::new(I64Comparator), 32, 32);
//! tree.insert(42, RecordId::new(PageId::new(0), SlotId::new(42)));
//! assert_eq!(tree.get_value(42).len(), 1);
//! ```

pub mod buffer;
pub mod common;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{BurrowError, PageId, RecordId, Result, SlotId, StorageConfig};
