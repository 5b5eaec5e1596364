use parking_lot::Mutex;

use crate::common::{FrameId, Timestamp};

/// Which queue a tracked frame currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueTag {
    History,
    Cache,
}

/// Per-frame bookkeeping. Nodes live in a fixed arena indexed by frame id;
/// `prev`/`next` are arena indices forming the intrusive queue links.
#[derive(Debug)]
struct LruKNode {
    /// Number of recorded accesses
    k: usize,
    /// Timestamp of the most recent access
    last_access: Timestamp,
    /// Whether this frame may be chosen as an eviction victim
    evictable: bool,
    queue: QueueTag,
    prev: Option<u32>,
    next: Option<u32>,
}

/// Doubly linked queue threaded through the node arena by index.
/// `head` is the most recently pushed end; `tail` the oldest.
#[derive(Debug, Default)]
struct IndexQueue {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl IndexQueue {
    fn push_front(&mut self, nodes: &mut [Option<LruKNode>], idx: u32) {
        let old_head = self.head;
        {
            let node = nodes[idx as usize].as_mut().unwrap();
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            nodes[h as usize].as_mut().unwrap().prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.len += 1;
    }

    fn unlink(&mut self, nodes: &mut [Option<LruKNode>], idx: u32) {
        let (prev, next) = {
            let node = nodes[idx as usize].as_mut().unwrap();
            let links = (node.prev, node.next);
            node.prev = None;
            node.next = None;
            links
        };
        match prev {
            Some(p) => nodes[p as usize].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => nodes[n as usize].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.len
    }
}

/// Everything behind the replacer latch.
struct ReplacerState {
    nodes: Vec<Option<LruKNode>>,
    history: IndexQueue,
    cache: IndexQueue,
    evictable_count: usize,
    current_timestamp: Timestamp,
}

impl ReplacerState {
    /// Unlinks a node from its queue and forgets its access history.
    /// The caller has already decided the node exists.
    fn detach(&mut self, idx: u32) {
        let queue = self.nodes[idx as usize].as_ref().unwrap().queue;
        match queue {
            QueueTag::History => self.history.unlink(&mut self.nodes, idx),
            QueueTag::Cache => self.cache.unlink(&mut self.nodes, idx),
        }
        self.nodes[idx as usize] = None;
        self.evictable_count -= 1;
    }
}

/// LRU-K replacement policy.
///
/// The replacer evicts the frame whose backward k-distance is the maximum
/// over all evictable frames. Frames with fewer than `k` recorded accesses
/// have infinite backward k-distance and live in a FIFO `history` queue;
/// once a frame reaches `k` accesses it graduates to the `cache` queue,
/// where the victim is the evictable frame with the oldest last access.
///
/// A single exclusive latch protects the whole structure. Queue membership
/// changes are O(1); only the cache scan during eviction walks a queue.
pub struct LruKReplacer {
    /// K value for the LRU-K algorithm
    k: usize,
    /// Maximum number of frames the replacer tracks
    num_frames: usize,
    state: Mutex<ReplacerState>,
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer tracking at most `num_frames` frames.
    pub fn new(k: usize, num_frames: usize) -> Self {
        assert!(k >= 2, "LRU-K requires k >= 2");
        let mut nodes = Vec::with_capacity(num_frames);
        nodes.resize_with(num_frames, || None);

        Self {
            k,
            num_frames,
            state: Mutex::new(ReplacerState {
                nodes,
                history: IndexQueue::default(),
                cache: IndexQueue::default(),
                evictable_count: 0,
                current_timestamp: 0,
            }),
        }
    }

    /// Evicts the frame with the largest backward k-distance.
    /// Returns None if there are no evictable frames.
    pub fn evict(&self) -> Option<FrameId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.evictable_count == 0 {
            return None;
        }

        // 1. History frames all have infinite k-distance; take the oldest
        //    evictable one (FIFO by first access, so scan from the tail).
        let mut cursor = state.history.tail;
        while let Some(idx) = cursor {
            let (evictable, prev) = {
                let node = state.nodes[idx as usize].as_ref().unwrap();
                (node.evictable, node.prev)
            };
            if evictable {
                state.detach(idx);
                return Some(FrameId::new(idx));
            }
            cursor = prev;
        }

        // 2. Otherwise pick the evictable cache frame with the oldest last
        //    access, which has the largest finite k-distance.
        let mut victim: Option<(u32, Timestamp)> = None;
        let mut cursor = state.cache.head;
        while let Some(idx) = cursor {
            let (evictable, last_access, next) = {
                let node = state.nodes[idx as usize].as_ref().unwrap();
                (node.evictable, node.last_access, node.next)
            };
            if evictable && victim.map_or(true, |(_, ts)| last_access < ts) {
                victim = Some((idx, last_access));
            }
            cursor = next;
        }

        if let Some((idx, _)) = victim {
            state.detach(idx);
            return Some(FrameId::new(idx));
        }
        None
    }

    /// Records that the given frame was accessed at the current timestamp.
    /// Creates a new history entry on first sight; a frame whose access
    /// count reaches `k` moves to the front of the cache queue.
    pub fn record_access(&self, frame_id: FrameId) {
        assert!(
            frame_id.as_usize() < self.num_frames,
            "invalid frame id {}",
            frame_id
        );

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let timestamp = state.current_timestamp;
        state.current_timestamp += 1;

        let idx = frame_id.as_u32();
        if state.nodes[idx as usize].is_none() {
            state.nodes[idx as usize] = Some(LruKNode {
                k: 1,
                last_access: timestamp,
                evictable: false,
                queue: QueueTag::History,
                prev: None,
                next: None,
            });
            state.history.push_front(&mut state.nodes, idx);
            return;
        }

        enum Move {
            Stay,
            HistoryToCache,
            CacheRefresh,
        }

        let action = {
            let node = state.nodes[idx as usize].as_mut().unwrap();
            node.k += 1;
            node.last_access = timestamp;
            match node.queue {
                QueueTag::History if node.k >= self.k => {
                    node.queue = QueueTag::Cache;
                    Move::HistoryToCache
                }
                // History stays FIFO by first access.
                QueueTag::History => Move::Stay,
                QueueTag::Cache => Move::CacheRefresh,
            }
        };

        match action {
            Move::Stay => {}
            Move::HistoryToCache => {
                state.history.unlink(&mut state.nodes, idx);
                state.cache.push_front(&mut state.nodes, idx);
            }
            Move::CacheRefresh => {
                state.cache.unlink(&mut state.nodes, idx);
                state.cache.push_front(&mut state.nodes, idx);
            }
        }
    }

    /// Sets whether a frame is evictable, adjusting the evictable count.
    /// Setting a flag to its current value is a no-op.
    pub fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        assert!(
            frame_id.as_usize() < self.num_frames,
            "invalid frame id {}",
            frame_id
        );

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let idx = frame_id.as_u32();

        if state.nodes[idx as usize].is_none() {
            if evictable {
                // First sight through set_evictable: track the frame with an
                // empty access history so eviction can still find it.
                state.nodes[idx as usize] = Some(LruKNode {
                    k: 0,
                    last_access: 0,
                    evictable: true,
                    queue: QueueTag::History,
                    prev: None,
                    next: None,
                });
                state.history.push_front(&mut state.nodes, idx);
                state.evictable_count += 1;
            }
            return;
        }

        let node = state.nodes[idx as usize].as_mut().unwrap();
        if node.evictable != evictable {
            node.evictable = evictable;
            if evictable {
                state.evictable_count += 1;
            } else {
                state.evictable_count -= 1;
            }
        }
    }

    /// Removes a frame from the replacer, along with its access history.
    /// The frame must currently be evictable; removing an untracked frame
    /// is a no-op.
    pub fn remove(&self, frame_id: FrameId) {
        if frame_id.as_usize() >= self.num_frames {
            return;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let idx = frame_id.as_u32();
        if let Some(node) = state.nodes[idx as usize].as_ref() {
            assert!(node.evictable, "cannot remove a non-evictable frame");
            state.detach(idx);
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.state.lock().evictable_count
    }

    /// Returns the k value of this replacer.
    pub fn k(&self) -> usize {
        self.k
    }

    #[cfg(test)]
    fn queue_lens(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.history.len(), state.cache.len())
    }
}
