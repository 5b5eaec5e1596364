use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, PAGE_SIZE};

use super::FrameHeader;

/// Callback the buffer pool installs to release a guard: it takes the pool
/// latch, unpins the frame, and hands it back to the replacer when the pin
/// count reaches zero. For write guards it also forces the dirty bit.
type ReleaseCallback = Box<dyn FnOnce() + Send>;

/// RAII guard for shared, read-only access to a page.
///
/// Holding the guard keeps the frame pinned and its latch held in shared
/// mode; both are released when the guard drops, on any exit path.
pub struct ReadPageGuard {
    /// The page ID being guarded
    page_id: PageId,
    /// Keeps the frame alive for the transmuted lock guard below
    _frame: Arc<FrameHeader>,
    release: Option<ReleaseCallback>,
    /// Shared latch on the page bytes
    data_guard: Option<RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl ReadPageGuard {
    /// Creates a new ReadPageGuard, blocking until the frame's shared latch
    /// is available.
    ///
    /// # Safety
    /// The caller must ensure the frame outlives this guard; the buffer pool
    /// guarantees it by handing over an `Arc` to the frame.
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release: ReleaseCallback,
    ) -> Self {
        let data_guard = frame.data.read();
        // The lifetime is erased; the Arc held alongside keeps the lock's
        // referent alive.
        let data_guard: RwLockReadGuard<'static, Box<[u8; PAGE_SIZE]>> =
            std::mem::transmute(data_guard);

        Self {
            page_id,
            _frame: frame,
            release: Some(release),
            data_guard: Some(data_guard),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns a reference to the page bytes.
    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }

    /// Releases the guard before end-of-scope.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // Release the frame latch before unpinning.
        self.data_guard.take();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// RAII guard for exclusive, read-write access to a page.
///
/// Holding the guard keeps the frame pinned and its latch held exclusively.
/// Dropping it releases both and marks the frame dirty, so the page is
/// written back before its frame is reused.
pub struct WritePageGuard {
    page_id: PageId,
    _frame: Arc<FrameHeader>,
    release: Option<ReleaseCallback>,
    /// Exclusive latch on the page bytes
    data_guard: Option<RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>>>,
}

impl WritePageGuard {
    /// Creates a new WritePageGuard, blocking until the frame's exclusive
    /// latch is available.
    ///
    /// # Safety
    /// The caller must ensure the frame outlives this guard; the buffer pool
    /// guarantees it by handing over an `Arc` to the frame.
    pub(crate) unsafe fn new(
        page_id: PageId,
        frame: Arc<FrameHeader>,
        release: ReleaseCallback,
    ) -> Self {
        let data_guard = frame.data.write();
        let data_guard: RwLockWriteGuard<'static, Box<[u8; PAGE_SIZE]>> =
            std::mem::transmute(data_guard);

        Self {
            page_id,
            _frame: frame,
            release: Some(release),
            data_guard: Some(data_guard),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns a reference to the page bytes.
    pub fn data(&self) -> &[u8] {
        &self.data_guard.as_ref().unwrap()[..]
    }

    /// Returns a mutable reference to the page bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data_guard.as_mut().unwrap()[..]
    }

    /// Releases the guard before end-of-scope.
    pub fn drop_guard(self) {
        drop(self);
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        // Release the frame latch before unpinning.
        self.data_guard.take();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FrameId;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_read_page_guard_releases_on_drop() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.set_page_id(PageId::new(1));

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 42;
        frame.copy_from(&data);

        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();

        let guard = unsafe {
            ReadPageGuard::new(
                PageId::new(1),
                frame.clone(),
                Box::new(move || {
                    released_clone.store(true, Ordering::SeqCst);
                }),
            )
        };

        assert_eq!(guard.page_id(), PageId::new(1));
        assert_eq!(guard.data()[0], 42);
        assert!(!released.load(Ordering::SeqCst));

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_page_guard_mutates_frame() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        frame.set_page_id(PageId::new(1));

        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();

        let mut guard = unsafe {
            WritePageGuard::new(
                PageId::new(1),
                frame.clone(),
                Box::new(move || {
                    released_clone.store(true, Ordering::SeqCst);
                }),
            )
        };

        guard.data_mut()[0] = 42;
        drop(guard);
        assert!(released.load(Ordering::SeqCst));

        let mut read_back = [0u8; PAGE_SIZE];
        frame.copy_to(&mut read_back);
        assert_eq!(read_back[0], 42);
    }

    #[test]
    fn test_guard_latch_is_released_before_callback_runs() {
        let frame = Arc::new(FrameHeader::new(FrameId::new(0)));
        let frame_for_probe = Arc::clone(&frame);

        // The release callback probing the latch would deadlock if the data
        // guard were still held when it runs.
        let guard = unsafe {
            ReadPageGuard::new(
                PageId::new(1),
                frame.clone(),
                Box::new(move || {
                    assert!(frame_for_probe.data.try_write().is_some());
                }),
            )
        };
        drop(guard);
    }
}
