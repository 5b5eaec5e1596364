use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use crate::buffer::{BufferPoolManager, WritePageGuard};
use crate::common::{PageId, RecordId, INVALID_PAGE_ID};

use super::btree_iterator::IndexIterator;
use super::btree_page::{
    page_type, BTreeHeaderPageMut, BTreeHeaderPageRef, BTreePageType, InternalPageMut,
    InternalPageRef, LeafPageMut, LeafPageRef,
};
use super::key_comparator::KeyComparator;

/// Per-operation ambient state for latch crabbing.
///
/// `write_set` holds exclusive guards from the root toward the current node,
/// oldest first. The header guard rides along so a restructure that changes
/// the root can publish the new root page id. Releasing ancestors the moment
/// a child proves safe is what lets concurrent operations pass each other on
/// disjoint subtrees.
struct Context {
    header: Option<WritePageGuard>,
    root_page_id: PageId,
    write_set: VecDeque<WritePageGuard>,
}

impl Context {
    fn new(header: WritePageGuard, root_page_id: PageId) -> Self {
        Self {
            header: Some(header),
            root_page_id,
            write_set: VecDeque::new(),
        }
    }

    /// Drops every retained ancestor guard, header included.
    fn release_ancestors(&mut self) {
        self.header.take();
        self.write_set.clear();
    }
}

/// What the descent is about to do to the node it is inspecting; decides
/// when an ancestor chain can be released.
#[derive(Clone, Copy)]
enum Operation {
    Insert,
    Delete,
}

/// A disk-resident B+ tree index mapping `i64` keys to record ids.
///
/// All state lives in buffer pool pages: a header page holding the root page
/// id, internal pages routing keys to subtrees, and leaf pages chained left
/// to right through sibling pointers. Reads descend with shared guards,
/// releasing each parent as soon as the child guard is held; writes descend
/// with exclusive guards and keep the ancestor chain only while a split or
/// merge might still propagate into it.
pub struct BPlusTree {
    header_page_id: PageId,
    bpm: Arc<BufferPoolManager>,
    comparator: Arc<dyn KeyComparator>,
    leaf_max_size: usize,
    internal_max_size: usize,
}

impl BPlusTree {
    /// Creates a new, empty tree: allocates the header page and publishes an
    /// invalid root.
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        comparator: Arc<dyn KeyComparator>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        assert!(leaf_max_size >= 2, "leaf_max_size must be at least 2");
        assert!(internal_max_size >= 3, "internal_max_size must be at least 3");

        let header_page_id = bpm.new_page();
        {
            let mut guard = bpm.write_page(header_page_id);
            let mut header = BTreeHeaderPageMut::new(guard.data_mut());
            header.init();
        }

        Self {
            header_page_id,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
        }
    }

    /// Reattaches to a tree whose header page already exists on disk.
    pub fn open(
        header_page_id: PageId,
        bpm: Arc<BufferPoolManager>,
        comparator: Arc<dyn KeyComparator>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        Self {
            header_page_id,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
        }
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    /// Returns the current root page id (`INVALID_PAGE_ID` when empty).
    pub fn root_page_id(&self) -> PageId {
        let guard = self.bpm.read_page(self.header_page_id);
        BTreeHeaderPageRef::new(guard.data()).root_page_id()
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    /// Point lookup. Returns every record stored under `key`; with unique
    /// keys that is zero or one.
    pub fn get_value(&self, key: i64) -> Vec<RecordId> {
        let header_guard = self.bpm.read_page(self.header_page_id);
        let root_id = BTreeHeaderPageRef::new(header_guard.data()).root_page_id();
        if root_id == INVALID_PAGE_ID {
            return Vec::new();
        }

        let mut guard = self.bpm.read_page(root_id);
        drop(header_guard);

        loop {
            match page_type(guard.data()) {
                BTreePageType::Leaf => {
                    let leaf = LeafPageRef::new(guard.data());
                    return leaf
                        .lookup(key, self.comparator.as_ref())
                        .into_iter()
                        .collect();
                }
                BTreePageType::Internal => {
                    let child_id = {
                        let internal = InternalPageRef::new(guard.data());
                        internal.child_at(internal.lookup(key, self.comparator.as_ref()))
                    };
                    // Crab: grab the child before letting go of the parent.
                    let child = self.bpm.read_page(child_id);
                    guard = child;
                }
            }
        }
    }

    /// Inserts a key/record pair. Returns false if the key already exists.
    pub fn insert(&self, key: i64, rid: RecordId) -> bool {
        let mut header_guard = self.bpm.write_page(self.header_page_id);
        let root_id = BTreeHeaderPageMut::new(header_guard.data_mut()).root_page_id();

        if root_id == INVALID_PAGE_ID {
            let leaf_id = self.bpm.new_page();
            {
                let mut leaf_guard = self.bpm.write_page(leaf_id);
                let mut leaf = LeafPageMut::init(leaf_guard.data_mut(), self.leaf_max_size);
                leaf.insert_key_value(key, rid, self.comparator.as_ref());
            }
            BTreeHeaderPageMut::new(header_guard.data_mut()).set_root_page_id(leaf_id);
            trace!(%leaf_id, "started new tree");
            return true;
        }

        let mut ctx = Context::new(header_guard, root_id);
        let mut leaf_guard = self.descend(&mut ctx, key, Operation::Insert);

        // Duplicate check and the easy path.
        {
            let mut leaf = LeafPageMut::new(leaf_guard.data_mut());
            if leaf.lookup(key, self.comparator.as_ref()).is_some() {
                return false;
            }
            if leaf.size() < leaf.max_size() {
                leaf.insert_key_value(key, rid, self.comparator.as_ref());
                return true;
            }
        }

        // The leaf is full: split it, then bubble the separator upward.
        let sibling_id = self.bpm.new_page();
        let mut sibling_guard = self.bpm.write_page(sibling_id);
        let separator = {
            let mut leaf = LeafPageMut::new(leaf_guard.data_mut());
            let mut sibling = LeafPageMut::init(sibling_guard.data_mut(), self.leaf_max_size);
            leaf.split_into(
                &mut sibling,
                sibling_id,
                key,
                rid,
                self.comparator.as_ref(),
            )
        };
        trace!(leaf = %leaf_guard.page_id(), %sibling_id, separator, "leaf split");

        let mut left_id = leaf_guard.page_id();
        drop(sibling_guard);
        drop(leaf_guard);

        let mut push_key = separator;
        let mut right_id = sibling_id;

        loop {
            match ctx.write_set.pop_back() {
                Some(mut parent_guard) => {
                    let parent_id = parent_guard.page_id();
                    let mut parent = InternalPageMut::new(parent_guard.data_mut());
                    if parent.size() < parent.max_size() {
                        parent.insert_key_child(push_key, right_id, self.comparator.as_ref());
                        return true;
                    }

                    let new_id = self.bpm.new_page();
                    let mut new_guard = self.bpm.write_page(new_id);
                    let mut new_internal =
                        InternalPageMut::init(new_guard.data_mut(), self.internal_max_size);
                    push_key = parent.split_into(
                        &mut new_internal,
                        push_key,
                        right_id,
                        self.comparator.as_ref(),
                    );
                    right_id = new_id;
                    left_id = parent_id;
                    trace!(parent = %parent_id, sibling = %new_id, "internal split");
                }
                None => {
                    // The split escaped the old root: grow the tree by one
                    // level and publish the new root.
                    let new_root_id = self.bpm.new_page();
                    {
                        let mut root_guard = self.bpm.write_page(new_root_id);
                        let mut root =
                            InternalPageMut::init(root_guard.data_mut(), self.internal_max_size);
                        root.populate_new_root(left_id, push_key, right_id);
                    }
                    let mut header_guard = ctx
                        .header
                        .take()
                        .expect("a root split must retain the header guard");
                    BTreeHeaderPageMut::new(header_guard.data_mut()).set_root_page_id(new_root_id);
                    trace!(%new_root_id, "tree grew a level");
                    return true;
                }
            }
        }
    }

    /// Deletes `key` from the tree; absent keys are a no-op.
    pub fn remove(&self, key: i64) {
        let mut header_guard = self.bpm.write_page(self.header_page_id);
        let root_id = BTreeHeaderPageMut::new(header_guard.data_mut()).root_page_id();
        if root_id == INVALID_PAGE_ID {
            return;
        }

        let mut ctx = Context::new(header_guard, root_id);
        let mut leaf_guard = self.descend(&mut ctx, key, Operation::Delete);
        let leaf_id = leaf_guard.page_id();

        let (removed, size, min_size) = {
            let mut leaf = LeafPageMut::new(leaf_guard.data_mut());
            let removed = leaf.delete_key(key, self.comparator.as_ref());
            (removed, leaf.size(), leaf.min_size())
        };
        if !removed {
            return;
        }

        if leaf_id == ctx.root_page_id {
            // The root leaf may shrink arbitrarily; an empty root unwinds
            // the tree back to nothing.
            if size == 0 {
                let mut header_guard = ctx
                    .header
                    .take()
                    .expect("emptying the root must retain the header guard");
                BTreeHeaderPageMut::new(header_guard.data_mut())
                    .set_root_page_id(INVALID_PAGE_ID);
                drop(leaf_guard);
                self.bpm.delete_page(leaf_id);
                trace!(%leaf_id, "tree emptied");
            }
            return;
        }

        if size >= min_size {
            return;
        }

        self.rebalance_leaf(&mut ctx, leaf_guard);
    }

    /// Descends from the root to the leaf responsible for `key`, taking
    /// exclusive guards and releasing ancestors whenever the child is safe
    /// for the pending operation.
    fn descend(&self, ctx: &mut Context, key: i64, op: Operation) -> WritePageGuard {
        let mut guard = self.bpm.write_page(ctx.root_page_id);

        loop {
            let is_root = guard.page_id() == ctx.root_page_id;
            let (is_leaf, child_id) = {
                let data = guard.data();
                match page_type(data) {
                    BTreePageType::Leaf => {
                        let leaf = LeafPageRef::new(data);
                        if Self::leaf_is_safe(&leaf, is_root, op) {
                            ctx.release_ancestors();
                        }
                        (true, INVALID_PAGE_ID)
                    }
                    BTreePageType::Internal => {
                        let internal = InternalPageRef::new(data);
                        if Self::internal_is_safe(&internal, is_root, op) {
                            ctx.release_ancestors();
                        }
                        let child =
                            internal.child_at(internal.lookup(key, self.comparator.as_ref()));
                        (false, child)
                    }
                }
            };

            if is_leaf {
                return guard;
            }
            ctx.write_set.push_back(guard);
            guard = self.bpm.write_page(child_id);
        }
    }

    /// A leaf is safe when the pending operation cannot propagate out of it.
    fn leaf_is_safe(leaf: &LeafPageRef<'_>, is_root: bool, op: Operation) -> bool {
        match op {
            Operation::Insert => leaf.size() < leaf.max_size(),
            // A root leaf only needs the header when it might empty out.
            Operation::Delete if is_root => leaf.size() > 1,
            Operation::Delete => leaf.size() > leaf.min_size(),
        }
    }

    fn internal_is_safe(internal: &InternalPageRef<'_>, is_root: bool, op: Operation) -> bool {
        match op {
            Operation::Insert => internal.size() < internal.max_size(),
            // A root internal collapses once it is down to one child, so it
            // stays unsafe at two.
            Operation::Delete if is_root => internal.size() > 2,
            Operation::Delete => internal.size() > internal.min_size(),
        }
    }

    /// Restores the minimum-fill invariant for an underfull leaf by
    /// borrowing from or merging with a sibling, preferring the right one.
    fn rebalance_leaf(&self, ctx: &mut Context, mut leaf_guard: WritePageGuard) {
        let leaf_id = leaf_guard.page_id();
        let mut parent_guard = ctx
            .write_set
            .pop_back()
            .expect("underfull non-root leaf must have a retained parent");

        let (idx, has_right, sibling_id) = {
            let parent = InternalPageRef::new(parent_guard.data());
            let idx = parent
                .find_child_index(leaf_id)
                .expect("leaf missing from its parent");
            let has_right = idx + 1 < parent.size();
            let sibling_id = if has_right {
                parent.child_at(idx + 1)
            } else {
                parent.child_at(idx - 1)
            };
            (idx, has_right, sibling_id)
        };

        let mut sibling_guard = self.bpm.write_page(sibling_id);
        let mut parent = InternalPageMut::new(parent_guard.data_mut());

        if has_right {
            let mut leaf = LeafPageMut::new(leaf_guard.data_mut());
            let mut right = LeafPageMut::new(sibling_guard.data_mut());
            if right.size() > right.min_size() {
                // Borrow the right sibling's first entry.
                let (k, r) = right.remove_at(0);
                leaf.insert_at(leaf.size(), k, r);
                parent.set_key_at(idx + 1, right.key_at(0));
                trace!(%leaf_id, from = %sibling_id, "leaf borrowed from right");
                return;
            }
            leaf.combine_from(&mut right);
            parent.remove_at(idx + 1);
            drop(sibling_guard);
            self.bpm.delete_page(sibling_id);
            trace!(%leaf_id, merged = %sibling_id, "leaf merged with right sibling");
        } else {
            let mut left = LeafPageMut::new(sibling_guard.data_mut());
            let mut leaf = LeafPageMut::new(leaf_guard.data_mut());
            if left.size() > left.min_size() {
                // Borrow the left sibling's last entry.
                let (k, r) = left.remove_at(left.size() - 1);
                leaf.insert_at(0, k, r);
                parent.set_key_at(idx, k);
                trace!(%leaf_id, from = %sibling_id, "leaf borrowed from left");
                return;
            }
            left.combine_from(&mut leaf);
            parent.remove_at(idx);
            drop(leaf_guard);
            self.bpm.delete_page(leaf_id);
            trace!(merged = %leaf_id, into = %sibling_id, "leaf merged into left sibling");
        }

        drop(parent);
        self.rebalance_internal(ctx, parent_guard);
    }

    /// Walks the retained ancestor chain after a merge removed a separator,
    /// borrowing or merging internal nodes and collapsing the root when it
    /// is left with a single child.
    fn rebalance_internal(&self, ctx: &mut Context, mut node_guard: WritePageGuard) {
        let node_id = node_guard.page_id();

        if node_id == ctx.root_page_id {
            let collapse_to = {
                let node = InternalPageRef::new(node_guard.data());
                if node.size() == 1 {
                    Some(node.child_at(0))
                } else {
                    None
                }
            };
            if let Some(new_root) = collapse_to {
                let mut header_guard = ctx
                    .header
                    .take()
                    .expect("collapsing the root must retain the header guard");
                BTreeHeaderPageMut::new(header_guard.data_mut()).set_root_page_id(new_root);
                drop(node_guard);
                self.bpm.delete_page(node_id);
                trace!(old_root = %node_id, %new_root, "tree shrank a level");
            }
            return;
        }

        {
            let node = InternalPageRef::new(node_guard.data());
            if node.size() >= node.min_size() {
                return;
            }
        }

        let mut parent_guard = ctx
            .write_set
            .pop_back()
            .expect("underfull non-root internal node must have a retained parent");

        let (idx, has_right, sibling_id) = {
            let parent = InternalPageRef::new(parent_guard.data());
            let idx = parent
                .find_child_index(node_id)
                .expect("internal node missing from its parent");
            let has_right = idx + 1 < parent.size();
            let sibling_id = if has_right {
                parent.child_at(idx + 1)
            } else {
                parent.child_at(idx - 1)
            };
            (idx, has_right, sibling_id)
        };

        let mut sibling_guard = self.bpm.write_page(sibling_id);
        let mut parent = InternalPageMut::new(parent_guard.data_mut());

        if has_right {
            let mut node = InternalPageMut::new(node_guard.data_mut());
            let mut right = InternalPageMut::new(sibling_guard.data_mut());
            if right.size() > right.min_size() {
                // Rotate through the parent: the separator comes down, the
                // right sibling's first key goes up.
                node.append_child(parent.key_at(idx + 1), right.child_at(0));
                parent.set_key_at(idx + 1, right.key_at(1));
                right.remove_at(0);
                trace!(%node_id, from = %sibling_id, "internal borrowed from right");
                return;
            }
            node.combine_from(parent.key_at(idx + 1), &mut right);
            parent.remove_at(idx + 1);
            drop(sibling_guard);
            self.bpm.delete_page(sibling_id);
            trace!(%node_id, merged = %sibling_id, "internal merged with right sibling");
        } else {
            let mut left = InternalPageMut::new(sibling_guard.data_mut());
            let mut node = InternalPageMut::new(node_guard.data_mut());
            if left.size() > left.min_size() {
                let (k, c) = left.remove_last();
                node.prepend_child(parent.key_at(idx), c);
                parent.set_key_at(idx, k);
                trace!(%node_id, from = %sibling_id, "internal borrowed from left");
                return;
            }
            left.combine_from(parent.key_at(idx), &mut node);
            parent.remove_at(idx);
            drop(node_guard);
            self.bpm.delete_page(node_id);
            trace!(merged = %node_id, into = %sibling_id, "internal merged into left sibling");
        }

        drop(parent);
        self.rebalance_internal(ctx, parent_guard);
    }

    /// Cursor positioned at the smallest key.
    pub fn iter(&self) -> IndexIterator {
        let header_guard = self.bpm.read_page(self.header_page_id);
        let root_id = BTreeHeaderPageRef::new(header_guard.data()).root_page_id();
        if root_id == INVALID_PAGE_ID {
            return IndexIterator::end(Arc::clone(&self.bpm));
        }

        let mut guard = self.bpm.read_page(root_id);
        drop(header_guard);

        loop {
            match page_type(guard.data()) {
                BTreePageType::Leaf => {
                    return IndexIterator::new(Arc::clone(&self.bpm), guard, 0);
                }
                BTreePageType::Internal => {
                    let child_id = InternalPageRef::new(guard.data()).child_at(0);
                    let child = self.bpm.read_page(child_id);
                    guard = child;
                }
            }
        }
    }

    /// Cursor positioned at `key` exactly, or the end cursor if the key is
    /// not in the tree.
    pub fn iter_from(&self, key: i64) -> IndexIterator {
        let header_guard = self.bpm.read_page(self.header_page_id);
        let root_id = BTreeHeaderPageRef::new(header_guard.data()).root_page_id();
        if root_id == INVALID_PAGE_ID {
            return IndexIterator::end(Arc::clone(&self.bpm));
        }

        let mut guard = self.bpm.read_page(root_id);
        drop(header_guard);

        loop {
            match page_type(guard.data()) {
                BTreePageType::Leaf => {
                    let pos = {
                        let leaf = LeafPageRef::new(guard.data());
                        let idx = leaf.search_key_index(key, self.comparator.as_ref());
                        if idx < leaf.size()
                            && self
                                .comparator
                                .compare(leaf.key_at(idx), key)
                                == std::cmp::Ordering::Equal
                        {
                            Some(idx)
                        } else {
                            None
                        }
                    };
                    return match pos {
                        Some(idx) => IndexIterator::new(Arc::clone(&self.bpm), guard, idx),
                        None => IndexIterator::end(Arc::clone(&self.bpm)),
                    };
                }
                BTreePageType::Internal => {
                    let child_id = {
                        let internal = InternalPageRef::new(guard.data());
                        internal.child_at(internal.lookup(key, self.comparator.as_ref()))
                    };
                    let child = self.bpm.read_page(child_id);
                    guard = child;
                }
            }
        }
    }

    /// The end cursor.
    pub fn end(&self) -> IndexIterator {
        IndexIterator::end(Arc::clone(&self.bpm))
    }

    /// Collects every entry with `start <= key <= end` in key order.
    pub fn range_scan(&self, start: i64, end: i64) -> Vec<(i64, RecordId)> {
        let header_guard = self.bpm.read_page(self.header_page_id);
        let root_id = BTreeHeaderPageRef::new(header_guard.data()).root_page_id();
        if root_id == INVALID_PAGE_ID {
            return Vec::new();
        }

        let mut guard = self.bpm.read_page(root_id);
        drop(header_guard);

        // Descend to the leaf covering `start`, then walk the chain.
        loop {
            match page_type(guard.data()) {
                BTreePageType::Leaf => break,
                BTreePageType::Internal => {
                    let child_id = {
                        let internal = InternalPageRef::new(guard.data());
                        internal.child_at(internal.lookup(start, self.comparator.as_ref()))
                    };
                    let child = self.bpm.read_page(child_id);
                    guard = child;
                }
            }
        }

        let pos = LeafPageRef::new(guard.data()).search_key_index(start, self.comparator.as_ref());
        let iter = IndexIterator::new(Arc::clone(&self.bpm), guard, pos);

        let mut results = Vec::new();
        for (key, rid) in iter {
            if self.comparator.compare(key, end) == std::cmp::Ordering::Greater {
                break;
            }
            results.push((key, rid));
        }
        results
    }
}
