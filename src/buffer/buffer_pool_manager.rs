use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::common::{FrameId, PageId, StorageConfig, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::{FrameHeader, LruKReplacer, ReadPageGuard, WritePageGuard};

/// Bookkeeping protected by the single buffer pool latch.
struct PoolInner {
    /// Page table: maps resident page IDs to frame IDs
    page_table: HashMap<PageId, FrameId>,
    /// Frames not currently holding any page
    free_list: VecDeque<FrameId>,
}

/// State shared between the pool and the release paths of its page guards.
struct BufferPoolState {
    /// The buffer pool frames, allocated up front
    frames: Vec<Arc<FrameHeader>>,
    /// The buffer pool latch (page table + free list)
    inner: Mutex<PoolInner>,
    /// LRU-K replacer for eviction decisions
    replacer: LruKReplacer,
}

/// BufferPoolManager mediates between the paged disk file and a fixed set of
/// in-memory frames. Pages are faulted in on demand through the disk
/// scheduler, pinned by page guards while in use, and evicted by the LRU-K
/// replacer when every frame is occupied.
///
/// The pool latch covers the page table, the free list, and the bookkeeping
/// hop into the replacer; page contents are protected by per-frame latches
/// that the guards acquire after the pool latch is released.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    pool_size: usize,
    /// Monotonic page id allocator
    next_page_id: AtomicU32,
    /// Shared state (also captured by guard release callbacks)
    state: Arc<BufferPoolState>,
    /// Disk scheduler for async I/O
    disk_scheduler: DiskScheduler,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager over the given disk manager.
    /// Panics on an invalid configuration; misconfiguration is a programming
    /// error, not a runtime condition.
    pub fn new(config: &StorageConfig, disk_manager: Arc<DiskManager>) -> Self {
        config.validate().expect("invalid storage configuration");

        let pool_size = config.buffer_pool_capacity;
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        // Resume page id allocation after whatever the file already holds.
        let next_page_id = AtomicU32::new(disk_manager.num_pages());

        let state = Arc::new(BufferPoolState {
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(pool_size),
                free_list,
            }),
            replacer: LruKReplacer::new(config.lru_k_parameter, pool_size),
        });

        Self {
            pool_size,
            next_page_id,
            state,
            disk_scheduler: DiskScheduler::new(disk_manager, config.disk_io_workers),
        }
    }

    /// Allocates a new page on disk and returns its ID. No frame is claimed
    /// until the page is first read or written.
    pub fn new_page(&self) -> PageId {
        let page_id = PageId::new(self.next_page_id.fetch_add(1, Ordering::SeqCst));
        self.disk_scheduler
            .disk_manager()
            .increase_disk_space(page_id)
            .expect("failed to grow database file");
        page_id
    }

    /// Removes a page from memory and marks it deallocated on disk.
    ///
    /// Returns `false` if the page is resident and pinned; `true` if the
    /// page was deleted or was not resident to begin with.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut inner = self.state.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];

            if frame.pin_count() > 0 {
                return false;
            }

            inner.page_table.remove(&page_id);
            self.state.replacer.remove(frame_id);
            frame.reset();
            inner.free_list.push_back(frame_id);
        }

        self.disk_scheduler
            .disk_manager()
            .deallocate_page(page_id)
            .expect("failed to deallocate page");
        true
    }

    /// Acquires a shared guard over a page, faulting it in if necessary.
    /// Returns None when every frame is pinned.
    pub fn checked_read_page(&self, page_id: PageId) -> Option<ReadPageGuard> {
        assert_ne!(page_id, INVALID_PAGE_ID, "cannot read the invalid page");

        let frame_id = self.allocate_frame(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        let state = Arc::clone(&self.state);

        let guard = unsafe {
            ReadPageGuard::new(
                page_id,
                frame,
                Box::new(move || {
                    let _latch = state.inner.lock();
                    let frame = &state.frames[frame_id.as_usize()];
                    if let Some(0) = frame.unpin() {
                        state.replacer.set_evictable(frame_id, true);
                    }
                }),
            )
        };

        Some(guard)
    }

    /// Acquires an exclusive guard over a page, faulting it in if necessary.
    /// Returns None when every frame is pinned.
    pub fn checked_write_page(&self, page_id: PageId) -> Option<WritePageGuard> {
        assert_ne!(page_id, INVALID_PAGE_ID, "cannot write the invalid page");

        let frame_id = self.allocate_frame(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);
        let state = Arc::clone(&self.state);

        let guard = unsafe {
            WritePageGuard::new(
                page_id,
                frame,
                Box::new(move || {
                    let _latch = state.inner.lock();
                    let frame = &state.frames[frame_id.as_usize()];
                    // A write guard always leaves the page dirty.
                    frame.set_dirty(true);
                    if let Some(0) = frame.unpin() {
                        state.replacer.set_evictable(frame_id, true);
                    }
                }),
            )
        };

        Some(guard)
    }

    /// Like [`Self::checked_read_page`], but aborts when the pool is
    /// exhausted. For callers that treat exhaustion as unrecoverable.
    pub fn read_page(&self, page_id: PageId) -> ReadPageGuard {
        self.checked_read_page(page_id)
            .unwrap_or_else(|| panic!("checked_read_page failed to bring in {}", page_id))
    }

    /// Like [`Self::checked_write_page`], but aborts when the pool is
    /// exhausted.
    pub fn write_page(&self, page_id: PageId) -> WritePageGuard {
        self.checked_write_page(page_id)
            .unwrap_or_else(|| panic!("checked_write_page failed to bring in {}", page_id))
    }

    /// Writes a resident page out to disk and clears its dirty flag.
    /// Returns false if the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> bool {
        let inner = self.state.inner.lock();

        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return false;
        };
        let frame = &self.state.frames[frame_id.as_usize()];

        let mut data = [0u8; PAGE_SIZE];
        frame.copy_to(&mut data);
        self.disk_scheduler
            .schedule_write_sync(page_id, &data)
            .expect("disk write failed");
        frame.set_dirty(false);

        true
    }

    /// Writes every dirty resident page out to disk.
    pub fn flush_all_pages(&self) {
        let inner = self.state.inner.lock();

        for (&page_id, &frame_id) in inner.page_table.iter() {
            let frame = &self.state.frames[frame_id.as_usize()];
            if !frame.is_dirty() {
                continue;
            }

            let mut data = [0u8; PAGE_SIZE];
            frame.copy_to(&mut data);
            self.disk_scheduler
                .schedule_write_sync(page_id, &data)
                .expect("disk write failed");
            frame.set_dirty(false);
        }
    }

    /// Returns the pin count of a resident page, or None if the page is not
    /// in memory. Intended for tests.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let inner = self.state.inner.lock();
        inner
            .page_table
            .get(&page_id)
            .map(|&frame_id| self.state.frames[frame_id.as_usize()].pin_count())
    }

    /// Returns the number of frames this pool manages.
    pub fn size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of frames currently holding no page.
    pub fn free_frame_count(&self) -> usize {
        self.state.inner.lock().free_list.len()
    }

    /// Returns a reference to the underlying disk manager.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        self.disk_scheduler.disk_manager()
    }

    /// Brings `page_id` into a frame and pins it.
    ///
    /// Three cases: the page is already resident; a free frame exists; or a
    /// victim must be evicted (flushing it first if dirty). Returns None when
    /// no frame can be freed. The pool latch is held for the whole call,
    /// including the synchronous I/O waits; the disk workers resolving those
    /// waits never take the pool latch.
    fn allocate_frame(&self, page_id: PageId) -> Option<FrameId> {
        let mut inner = self.state.inner.lock();

        // 1. Already resident: pin and record the access.
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];
            frame.pin();
            self.state.replacer.record_access(frame_id);
            self.state.replacer.set_evictable(frame_id, false);
            return Some(frame_id);
        }

        // 2. A free frame is available.
        let frame_id = if let Some(frame_id) = inner.free_list.pop_front() {
            frame_id
        } else {
            // 3. Evict a victim; write it back first if it is dirty.
            let frame_id = self.state.replacer.evict()?;
            let frame = &self.state.frames[frame_id.as_usize()];
            let old_page_id = frame.page_id();

            if frame.is_dirty() {
                let mut data = [0u8; PAGE_SIZE];
                frame.copy_to(&mut data);
                self.disk_scheduler
                    .schedule_write_sync(old_page_id, &data)
                    .expect("disk write failed");
                debug!(%old_page_id, %frame_id, "evicted dirty page written back");
            }

            inner.page_table.remove(&old_page_id);
            frame_id
        };

        let frame = &self.state.frames[frame_id.as_usize()];
        frame.reset();
        frame.set_page_id(page_id);

        // Fault the page in. Freshly allocated pages read back as zeroes
        // because new_page extends the file.
        let mut data = [0u8; PAGE_SIZE];
        self.disk_scheduler
            .schedule_read_sync(page_id, &mut data)
            .expect("disk read failed");
        frame.copy_from(&data);
        frame.pin();

        inner.page_table.insert(page_id, frame_id);
        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);

        Some(frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::StorageConfig;
    use tempfile::NamedTempFile;

    fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let config = StorageConfig {
            buffer_pool_capacity: pool_size,
            ..Default::default()
        };
        (BufferPoolManager::new(&config, dm), temp_file)
    }

    #[test]
    fn test_buffer_pool_manager_new() {
        let (bpm, _temp) = create_bpm(10);
        assert_eq!(bpm.size(), 10);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_buffer_pool_manager_new_page() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page();
        assert_eq!(page_id, PageId::new(0));
        // No frame is claimed until a guard is requested.
        assert_eq!(bpm.get_pin_count(page_id), None);
        assert_eq!(bpm.free_frame_count(), 10);
    }

    #[test]
    fn test_buffer_pool_manager_read_write() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page();

        {
            let mut guard = bpm.checked_write_page(page_id).unwrap();
            guard.data_mut()[0] = 42;
            guard.data_mut()[100] = 255;
            assert_eq!(bpm.get_pin_count(page_id), Some(1));
        }

        assert_eq!(bpm.get_pin_count(page_id), Some(0));

        {
            let guard = bpm.checked_read_page(page_id).unwrap();
            assert_eq!(guard.data()[0], 42);
            assert_eq!(guard.data()[100], 255);
        }
    }

    #[test]
    fn test_buffer_pool_manager_shared_readers() {
        let (bpm, _temp) = create_bpm(10);
        let page_id = bpm.new_page();

        let g1 = bpm.checked_read_page(page_id).unwrap();
        let g2 = bpm.checked_read_page(page_id).unwrap();
        assert_eq!(bpm.get_pin_count(page_id), Some(2));

        drop(g1);
        assert_eq!(bpm.get_pin_count(page_id), Some(1));
        drop(g2);
        assert_eq!(bpm.get_pin_count(page_id), Some(0));
    }

    #[test]
    fn test_buffer_pool_manager_flush_and_refault() {
        let (bpm, temp) = create_bpm(10);

        let page_id = bpm.new_page();
        {
            let mut guard = bpm.checked_write_page(page_id).unwrap();
            guard.data_mut()[0] = 42;
        }

        assert!(bpm.flush_page(page_id));
        assert!(!bpm.flush_page(PageId::new(999)));

        // A fresh pool over the same file must observe the flushed bytes.
        drop(bpm);
        let dm = Arc::new(DiskManager::new(temp.path()).unwrap());
        let config = StorageConfig {
            buffer_pool_capacity: 10,
            ..Default::default()
        };
        let bpm2 = BufferPoolManager::new(&config, dm);

        let guard = bpm2.checked_read_page(page_id).unwrap();
        assert_eq!(guard.data()[0], 42);
    }

    #[test]
    fn test_buffer_pool_manager_eviction_preserves_data() {
        let (bpm, _temp) = create_bpm(3);

        let page_ids: Vec<_> = (0..6).map(|_| bpm.new_page()).collect();

        for &pid in &page_ids {
            let mut guard = bpm.checked_write_page(pid).unwrap();
            guard.data_mut()[0] = pid.as_u32() as u8;
        }

        // Every page cycled through the 3 frames; re-faulting each one must
        // observe the write-back from its eviction.
        for &pid in &page_ids {
            let guard = bpm.checked_read_page(pid).unwrap();
            assert_eq!(guard.data()[0], pid.as_u32() as u8);
        }
    }

    #[test]
    fn test_buffer_pool_manager_exhaustion() {
        let (bpm, _temp) = create_bpm(2);

        let p1 = bpm.new_page();
        let p2 = bpm.new_page();
        let p3 = bpm.new_page();

        let _g1 = bpm.checked_read_page(p1).unwrap();
        let _g2 = bpm.checked_read_page(p2).unwrap();

        // Both frames are pinned: the checked variant reports exhaustion.
        assert!(bpm.checked_read_page(p3).is_none());
        assert!(bpm.checked_write_page(p3).is_none());
    }

    #[test]
    fn test_buffer_pool_manager_delete_page() {
        let (bpm, _temp) = create_bpm(10);

        let page_id = bpm.new_page();

        {
            let _guard = bpm.checked_read_page(page_id).unwrap();
            assert!(!bpm.delete_page(page_id));
        }

        assert!(bpm.delete_page(page_id));
        assert_eq!(bpm.get_pin_count(page_id), None);
        assert!(bpm.disk_manager().is_deallocated(page_id));

        // Deleting an absent page succeeds.
        assert!(bpm.delete_page(PageId::new(404)));
    }

    #[test]
    fn test_buffer_pool_manager_free_list_accounting() {
        let (bpm, _temp) = create_bpm(5);

        let pids: Vec<_> = (0..3).map(|_| bpm.new_page()).collect();
        for &pid in &pids {
            let _ = bpm.checked_read_page(pid).unwrap();
        }
        assert_eq!(bpm.free_frame_count(), 2);

        assert!(bpm.delete_page(pids[0]));
        assert_eq!(bpm.free_frame_count(), 3);
    }
}
