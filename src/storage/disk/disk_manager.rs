use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::common::{PageId, Result, PAGE_SIZE};

/// DiskManager is responsible for reading and writing pages to/from a single
/// paged database file. The file grows on demand through
/// [`DiskManager::increase_disk_space`]; deleted pages are only marked
/// deallocated, their space is never handed back.
pub struct DiskManager {
    /// File handle; the mutex also serializes the seek + read/write pair.
    file: Mutex<File>,
    /// Path to the database file
    db_path: PathBuf,
    /// Number of pages the file currently covers
    num_pages: AtomicU32,
    /// Number of disk reads performed
    num_reads: AtomicU32,
    /// Number of disk writes performed
    num_writes: AtomicU32,
    /// Pages that were deallocated and no longer hold live data
    free_slots: Mutex<HashSet<PageId>>,
}

impl DiskManager {
    /// Opens (or creates) the database file at the given path.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&db_path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            file: Mutex::new(file),
            db_path,
            num_pages: AtomicU32::new(num_pages),
            num_reads: AtomicU32::new(0),
            num_writes: AtomicU32::new(0),
            free_slots: Mutex::new(HashSet::new()),
        })
    }

    /// Reads a page from disk into the provided buffer.
    /// Reads past the end of the file yield zeroed bytes.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");

        let byte_offset = (page_id.as_u32() as u64) * (PAGE_SIZE as u64);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(byte_offset))?;

        let bytes_read = file.read(data)?;
        if bytes_read < PAGE_SIZE {
            data[bytes_read..].fill(0);
        }

        self.num_reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a page to disk from the provided buffer.
    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE, "Buffer must be PAGE_SIZE bytes");

        let byte_offset = (page_id.as_u32() as u64) * (PAGE_SIZE as u64);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(byte_offset))?;
        file.write_all(data)?;
        file.flush()?;

        self.num_writes.fetch_add(1, Ordering::Relaxed);

        let covered = page_id.as_u32() + 1;
        self.num_pages.fetch_max(covered, Ordering::Relaxed);
        Ok(())
    }

    /// Ensures the file is large enough to hold pages `0..=up_to`.
    pub fn increase_disk_space(&self, up_to: PageId) -> Result<()> {
        let required = up_to.as_u32() + 1;
        let current = self.num_pages.load(Ordering::Relaxed);
        if required <= current {
            return Ok(());
        }

        let file = self.file.lock();
        file.set_len((required as u64) * (PAGE_SIZE as u64))?;
        self.num_pages.fetch_max(required, Ordering::Relaxed);
        Ok(())
    }

    /// Marks the page's slot as deallocated. The slot is not reused.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        self.free_slots.lock().insert(page_id);
        Ok(())
    }

    /// Returns whether the page has been marked deallocated.
    pub fn is_deallocated(&self, page_id: PageId) -> bool {
        self.free_slots.lock().contains(&page_id)
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages.load(Ordering::Relaxed)
    }

    pub fn num_reads(&self) -> u32 {
        self.num_reads.load(Ordering::Relaxed)
    }

    pub fn num_writes(&self) -> u32 {
        self.num_writes.load(Ordering::Relaxed)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let file = self.file.get_mut();
        let _ = file.sync_all();
    }
}
