//! Concurrent in-memory B+ tree engines over unique ordered keys.
//!
//! Two concurrency strategies implement the same logical tree:
//!
//! * [`FineTree`] - clients traverse the tree themselves, coupling per-node
//!   shared/exclusive latches hand over hand and keeping ancestors latched
//!   only while a structural change could still reach them.
//! * [`PalmTree`] - clients enqueue requests; a coordinator thread batches
//!   them and a worker pool executes each batch in synchronized stages so no
//!   node is touched by two workers at once, in the style of the PALM
//!   design.
//!
//! [`SeqTree`] is the plain single-threaded tree the concurrent engines are
//! checked against, and [`CoarseTree`] wraps it in one mutex as the simplest
//! possible concurrent implementation.
//!
//! ```
//! use grove::FineTree;
//!
//! let tree = FineTree::new(16);
//! tree.insert(42);
//! assert_eq!(tree.get(&42), Some(42));
//! assert!(tree.remove(&42));
//! ```
//!
//! Keys are unique: inserting a present key is a no-op, and lookups return
//! the stored key. Both engines keep leaves chained in a doubly linked list,
//! so a quiesced tree yields its keys in ascending order.

pub mod error;
pub mod latch;

mod debug;
mod fine;
mod node;
mod ops;
mod palm;
mod seq;

pub use fine::FineTree;
pub use palm::{Lookup, PalmTree, DEFAULT_BATCH_SIZE};
pub use seq::{CoarseTree, SeqTree};

/// The capability shared by every tree engine: point insert, point delete,
/// point lookup and size.
///
/// [`PalmTree`] implements the blocking flavor of this contract by waiting
/// on each request's completion signal; its inherent methods expose the
/// enqueue-and-return flavor.
pub trait TreeIndex<K> {
    /// Inserts `key`; a key already present is left untouched.
    fn insert(&self, key: K);

    /// Removes `key`, reporting whether it was present.
    fn remove(&self, key: &K) -> bool;

    /// Looks up `key`, returning the stored key when present.
    fn get(&self, key: &K) -> Option<K>;

    /// Number of keys currently stored.
    fn size(&self) -> usize;
}
