pub mod btree_index;
pub mod btree_iterator;
pub mod btree_page;
pub mod key_comparator;

pub use btree_index::BPlusTree;
pub use btree_iterator::IndexIterator;
pub use btree_page::{
    BTreeHeaderPageMut, BTreeHeaderPageRef, BTreePageType, InternalPageMut, InternalPageRef,
    LeafPageMut, LeafPageRef, INTERNAL_SLOT_CAPACITY, LEAF_SLOT_CAPACITY,
};
pub use key_comparator::{I64Comparator, KeyComparator, ReverseI64Comparator};
