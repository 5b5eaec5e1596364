use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::trace;

use crate::common::{BurrowError, PageId, Result, PAGE_SIZE};

use super::DiskManager;

/// Represents a disk I/O request
pub struct DiskRequest {
    /// Whether this is a write (true) or read (false) request
    pub is_write: bool,
    /// The page ID to read/write
    pub page_id: PageId,
    /// Pointer to the data buffer (must be PAGE_SIZE bytes)
    /// For reads: data will be written here
    /// For writes: data will be read from here
    pub data: *mut u8,
    /// Promise to signal completion
    pub callback: Option<std::sync::mpsc::Sender<bool>>,
}

// Safety: a DiskRequest is handed to exactly one worker thread, and the
// caller must keep the data pointer valid until the completion callback
// fires.
unsafe impl Send for DiskRequest {}

impl DiskRequest {
    /// Creates a new read request
    pub fn read(page_id: PageId, data: *mut u8) -> Self {
        Self {
            is_write: false,
            page_id,
            data,
            callback: None,
        }
    }

    /// Creates a new write request
    pub fn write(page_id: PageId, data: *mut u8) -> Self {
        Self {
            is_write: true,
            page_id,
            data,
            callback: None,
        }
    }

    /// Sets the completion callback for this request
    pub fn with_callback(mut self, callback: std::sync::mpsc::Sender<bool>) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// DiskScheduler manages a pool of background worker threads that process
/// disk I/O requests.
///
/// Requests are sharded across workers by `page_id % worker_count`, and each
/// worker drains its own FIFO queue, so all requests for a fixed page
/// execute in the order they were scheduled: a write followed by a read of
/// the same page observes the write.
pub struct DiskScheduler {
    /// The disk manager for actual I/O operations
    disk_manager: Arc<DiskManager>,
    /// Per-worker request queues; a `None` tells the worker to exit
    request_queues: Vec<Sender<Option<DiskRequest>>>,
    /// Handles to the background worker threads
    worker_handles: Vec<JoinHandle<()>>,
}

impl DiskScheduler {
    /// Creates a new DiskScheduler with the given DiskManager and spawns
    /// `workers` background threads.
    pub fn new(disk_manager: Arc<DiskManager>, workers: usize) -> Self {
        assert!(workers >= 1, "disk scheduler needs at least one worker");

        let mut request_queues = Vec::with_capacity(workers);
        let mut worker_handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (sender, receiver) = unbounded::<Option<DiskRequest>>();
            let dm = Arc::clone(&disk_manager);

            worker_handles.push(thread::spawn(move || {
                Self::start_worker_thread(worker_id, dm, receiver);
            }));
            request_queues.push(sender);
        }

        Self {
            disk_manager,
            request_queues,
            worker_handles,
        }
    }

    /// Schedules a disk request for processing by a background worker.
    pub fn schedule(&self, request: DiskRequest) -> Result<()> {
        let shard = request.page_id.as_usize() % self.request_queues.len();
        self.request_queues[shard]
            .send(Some(request))
            .map_err(|e| BurrowError::DiskScheduler(format!("Failed to schedule request: {}", e)))
    }

    /// Schedules a read request and waits for completion.
    pub fn schedule_read_sync(&self, page_id: PageId, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let (tx, rx) = std::sync::mpsc::channel();
        let request = DiskRequest::read(page_id, data.as_mut_ptr()).with_callback(tx);

        self.schedule(request)?;

        let ok = rx.recv().map_err(|e| {
            BurrowError::DiskScheduler(format!("Failed to receive completion: {}", e))
        })?;
        assert!(ok, "disk read of {} failed", page_id);

        Ok(())
    }

    /// Schedules a write request and waits for completion.
    pub fn schedule_write_sync(&self, page_id: PageId, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);

        let (tx, rx) = std::sync::mpsc::channel();
        // Safety: the worker only reads through the pointer for writes.
        let request = DiskRequest::write(page_id, data.as_ptr() as *mut u8).with_callback(tx);

        self.schedule(request)?;

        let ok = rx.recv().map_err(|e| {
            BurrowError::DiskScheduler(format!("Failed to receive completion: {}", e))
        })?;
        assert!(ok, "disk write of {} failed", page_id);

        Ok(())
    }

    /// Worker loop: processes requests until the shutdown sentinel arrives.
    fn start_worker_thread(
        worker_id: usize,
        disk_manager: Arc<DiskManager>,
        receiver: Receiver<Option<DiskRequest>>,
    ) {
        trace!(worker_id, "disk worker started");
        while let Ok(Some(request)) = receiver.recv() {
            Self::process_request(&disk_manager, request);
        }
        trace!(worker_id, "disk worker exiting");
    }

    /// Processes a single disk request and resolves its callback.
    fn process_request(disk_manager: &DiskManager, request: DiskRequest) {
        let success = if request.is_write {
            // Safety: caller ensures the pointer is valid for PAGE_SIZE bytes
            let data = unsafe { std::slice::from_raw_parts(request.data, PAGE_SIZE) };
            disk_manager.write_page(request.page_id, data).is_ok()
        } else {
            // Safety: caller ensures the pointer is valid for PAGE_SIZE bytes
            let data = unsafe { std::slice::from_raw_parts_mut(request.data, PAGE_SIZE) };
            disk_manager.read_page(request.page_id, data).is_ok()
        };

        if let Some(callback) = request.callback {
            let _ = callback.send(success);
        }
    }

    /// Returns a reference to the underlying DiskManager.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Returns the number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.request_queues.len()
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        for queue in &self.request_queues {
            let _ = queue.send(None);
        }
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
    }
}
