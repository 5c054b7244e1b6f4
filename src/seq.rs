//! Sequential B+ tree and its coarse-grained concurrent wrapper.
//!
//! [`SeqTree`] drives the rebalancing kernel with plain `&mut self`
//! ownership; it exists as the single-threaded reference the concurrent
//! engines are measured against. [`CoarseTree`] is the smallest possible
//! concurrent tree: one mutex in front of a `SeqTree`.

use crate::debug;
use crate::node::NodeRef;
use crate::ops::{self, SiblingSide};
use crate::TreeIndex;
use parking_lot::Mutex;
use std::fmt;

/// Single-threaded B+ tree over unique ordered keys.
pub struct SeqTree<K> {
    dummy: NodeRef<K>,
    order: usize,
    len: usize,
}

impl<K: Clone + Ord> SeqTree<K> {
    /// Creates an empty tree with the given branching factor.
    ///
    /// # Panics
    /// Panics if `order < 3`.
    pub fn new(order: usize) -> SeqTree<K> {
        assert!(order >= 3, "order must be at least 3");
        SeqTree {
            dummy: NodeRef::alloc(true, true),
            order,
            len: 0,
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `key`; a key already present is left untouched.
    pub fn insert(&mut self, key: K) {
        unsafe {
            let dummy = self.dummy;
            {
                let mut d = dummy.latch().exclusive();
                if d.children.is_empty() {
                    let leaf: NodeRef<K> = NodeRef::alloc(true, false);
                    leaf.latch().exclusive().keys.push(key);
                    d.children.push(leaf);
                    d.is_leaf = false;
                    d.consolidate_children(dummy);
                    self.len = 1;
                    return;
                }
            }

            let leaf = self.find_leaf(&key);
            let inserted = ops::insert_into_leaf(&mut leaf.latch().exclusive(), key);
            if !inserted {
                return;
            }
            self.len += 1;

            let mut node = leaf;
            loop {
                if !node.latch().shared().is_full(self.order) {
                    break;
                }
                let parent = node.parent().expect("non-dummy node has a parent");
                let mut node_payload = node.latch().exclusive();
                let mut parent_payload = parent.latch().exclusive();
                let parent_full = ops::split_step(
                    self.order,
                    node,
                    &mut node_payload,
                    parent,
                    &mut parent_payload,
                );
                if !parent_full {
                    break;
                }
                drop(node_payload);
                drop(parent_payload);
                node = parent;
            }
        }
    }

    /// Removes `key`, reporting whether it was present.
    pub fn remove(&mut self, key: &K) -> bool {
        unsafe {
            let dummy = self.dummy;
            if dummy.latch().shared().children.is_empty() {
                return false;
            }

            let leaf = self.find_leaf(key);
            let (removed, now_empty) = {
                let mut g = leaf.latch().exclusive();
                let removed = ops::remove_from_leaf(&mut g, key);
                (removed, g.num_keys() == 0)
            };
            if !removed {
                return false;
            }
            self.len -= 1;

            let parent = leaf.parent().expect("leaf has a parent");
            if parent == dummy && now_empty {
                // Last key in the tree; fold back to the empty state.
                let mut d = dummy.latch().exclusive();
                d.children.clear();
                d.is_leaf = true;
                leaf.free();
                return true;
            }

            self.rebalance_from(leaf);
            true
        }
    }

    /// Looks up `key`, returning the stored key when present.
    pub fn get(&self, key: &K) -> Option<K> {
        unsafe {
            if self.dummy.latch().shared().children.is_empty() {
                return None;
            }
            let leaf = self.find_leaf(key);
            let g = leaf.latch().shared();
            g.key_position(key).map(|index| g.keys[index].clone())
        }
    }

    /// All keys in ascending order, walking the leaf chain.
    pub fn to_vec(&self) -> Vec<K> {
        unsafe {
            let mut out = Vec::with_capacity(self.len);
            let mut cur = self.dummy;
            loop {
                let g = cur.latch().shared();
                if g.is_leaf {
                    break;
                }
                match g.children.first() {
                    Some(&child) => cur = child,
                    None => return out,
                }
            }
            if cur == self.dummy {
                return out;
            }
            let mut walker = Some(cur);
            while let Some(node) = walker {
                let g = node.latch().shared();
                out.extend(g.keys.iter().cloned());
                walker = node.next();
            }
            out
        }
    }

    unsafe fn find_leaf(&self, key: &K) -> NodeRef<K> {
        let mut cur = self.dummy;
        loop {
            let g = cur.latch().shared();
            if g.is_leaf {
                return cur;
            }
            cur = g.children[g.gt_key_index(key)];
        }
    }

    /// Walks from an underfull node upward, borrowing or merging per level.
    unsafe fn rebalance_from(&mut self, start: NodeRef<K>) {
        let dummy = self.dummy;
        let mut node = start;
        loop {
            let parent = node.parent().expect("non-dummy node has a parent");
            let is_root = parent == dummy;
            {
                let g = node.latch().shared();
                if is_root {
                    if !g.is_leaf && g.num_keys() == 0 {
                        drop(g);
                        let mut d = dummy.latch().exclusive();
                        let mut r = node.latch().exclusive();
                        let freed = ops::promote_root_child(dummy, &mut d, node, &mut r);
                        drop(r);
                        drop(d);
                        freed.free();
                    }
                    return;
                }
                if ops::is_half_full(&g, self.order) {
                    return;
                }
            }

            let child_index = node.child_index();
            let side = if child_index > 0 {
                SiblingSide::Left
            } else {
                SiblingSide::Right
            };
            let mut parent_payload = parent.latch().exclusive();
            let sibling = match side {
                SiblingSide::Left => parent_payload.children[child_index - 1],
                SiblingSide::Right => parent_payload.children[child_index + 1],
            };
            let mut node_payload = node.latch().exclusive();
            let mut sibling_payload = sibling.latch().exclusive();

            if ops::more_half_full(&sibling_payload, self.order) {
                match side {
                    SiblingSide::Left => ops::borrow_from_left(
                        node,
                        &mut node_payload,
                        sibling,
                        &mut sibling_payload,
                        &mut parent_payload,
                    ),
                    SiblingSide::Right => ops::borrow_from_right(
                        node,
                        &mut node_payload,
                        sibling,
                        &mut sibling_payload,
                        &mut parent_payload,
                    ),
                }
                return;
            }

            let outcome = ops::merge_step(
                self.order,
                node,
                &mut node_payload,
                sibling,
                &mut sibling_payload,
                side,
                parent,
                &mut parent_payload,
            );
            drop(node_payload);
            drop(sibling_payload);
            drop(parent_payload);
            outcome.freed.free();
            node = parent;
        }
    }
}

impl<K: Clone + Ord + fmt::Debug> SeqTree<K> {
    /// Validates every structural invariant, panicking with a description of
    /// the first violation found.
    pub fn check_invariants(&self) {
        unsafe {
            debug::validate(self.dummy, self.order, (self.order - 1) / 2, false, self.len);
        }
    }

    /// Renders the tree level by level for diagnostics.
    pub fn dump(&self) -> String {
        unsafe { debug::render(self.dummy) }
    }
}

impl<K> Drop for SeqTree<K> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no outstanding access; the dummy owns the
        // whole graph.
        unsafe {
            self.dummy.release_subtree();
        }
    }
}

// SAFETY: the tree owns its node graph; moving or sharing the handle moves
// access to the same heap nodes, which are themselves Send + Sync for
// suitable K.
unsafe impl<K: Send + Sync> Send for SeqTree<K> {}
unsafe impl<K: Send + Sync> Sync for SeqTree<K> {}

/// The trivial concurrent tree: a single mutex around [`SeqTree`].
///
/// Used as the oracle in concurrency tests; every interleaving of operations
/// through it is by construction a serialization.
pub struct CoarseTree<K> {
    inner: Mutex<SeqTree<K>>,
}

impl<K: Clone + Ord> CoarseTree<K> {
    pub fn new(order: usize) -> CoarseTree<K> {
        CoarseTree {
            inner: Mutex::new(SeqTree::new(order)),
        }
    }

    pub fn insert(&self, key: K) {
        self.inner.lock().insert(key);
    }

    pub fn remove(&self, key: &K) -> bool {
        self.inner.lock().remove(key)
    }

    pub fn get(&self, key: &K) -> Option<K> {
        self.inner.lock().get(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<K> {
        self.inner.lock().to_vec()
    }
}

impl<K: Clone + Ord> TreeIndex<K> for CoarseTree<K> {
    fn insert(&self, key: K) {
        CoarseTree::insert(self, key);
    }

    fn remove(&self, key: &K) -> bool {
        CoarseTree::remove(self, key)
    }

    fn get(&self, key: &K) -> Option<K> {
        CoarseTree::get(self, key)
    }

    fn size(&self) -> usize {
        self.len()
    }
}
