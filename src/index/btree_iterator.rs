use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{RecordId, INVALID_PAGE_ID};

use super::btree_page::LeafPageRef;

/// Forward cursor over the leaf chain of a B+ tree.
///
/// Holds a shared guard on its current leaf plus a position within it. At a
/// leaf boundary the current guard is dropped *before* the next leaf is
/// read-guarded, so a cursor never holds two latches at once and cannot
/// participate in a latch cycle with writers rebalancing siblings.
///
/// The end cursor holds no guard; all end cursors compare equal and no
/// live cursor compares equal to the end.
pub struct IndexIterator {
    bpm: Arc<BufferPoolManager>,
    guard: Option<ReadPageGuard>,
    pos: usize,
}

impl IndexIterator {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, guard: ReadPageGuard, pos: usize) -> Self {
        Self {
            bpm,
            guard: Some(guard),
            pos,
        }
    }

    /// The past-the-end cursor.
    pub(crate) fn end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            guard: None,
            pos: 0,
        }
    }

    pub fn is_end(&self) -> bool {
        self.guard.is_none()
    }
}

impl Iterator for IndexIterator {
    type Item = (i64, RecordId);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let guard = self.guard.as_ref()?;
            let leaf = LeafPageRef::new(guard.data());

            if self.pos < leaf.size() {
                let entry = (leaf.key_at(self.pos), leaf.rid_at(self.pos));
                self.pos += 1;
                return Some(entry);
            }

            let next_id = leaf.next_page_id();
            // Let go of the current leaf before touching the next one.
            self.guard = None;
            self.pos = 0;
            if next_id == INVALID_PAGE_ID {
                return None;
            }
            self.guard = Some(self.bpm.read_page(next_id));
        }
    }
}

impl PartialEq for IndexIterator {
    fn eq(&self, other: &Self) -> bool {
        match (&self.guard, &other.guard) {
            (None, None) => true,
            (Some(a), Some(b)) => a.page_id() == b.page_id() && self.pos == other.pos,
            _ => false,
        }
    }
}

impl Eq for IndexIterator {}
