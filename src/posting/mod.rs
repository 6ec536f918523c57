//! Posting index and search cursors.
//!
//! [`PostingTree`] is the ordered, document-id-keyed posting structure;
//! [`PostingIterator`] is the strict, forward-only cursor query evaluation
//! drives over one tree snapshot, unpacking ranking features lazily.

pub mod iterator;
pub mod tree;

pub use iterator::*;
pub use tree::*;
