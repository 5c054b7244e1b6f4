//! Fine-grained latched B+ tree.
//!
//! Clients operate on the tree directly from their own threads. Reads couple
//! shared latches hand over hand from the dummy root down to a leaf. Writes
//! descend with exclusive latches held in a queue: when the next node is
//! *safe* (it can absorb the operation without propagating a structural
//! change to its parent), every ancestor latch is released; otherwise the
//! ancestors stay latched so an upward split or merge finds them already
//! held. The queue is released front to back once the operation completes.
//!
//! The dummy's latch doubles as the tree latch: it stays in the queue only
//! when the real root itself might be replaced (root split, root collapse),
//! which is exactly when the descent finds the root unsafe.
//!
//! Rebalancing additionally latches the one same-parent sibling it reads and
//! mutates. Sibling pairs are serialized by the exclusively held parent, so
//! that extra latch cannot deadlock: any other thread wanting either node
//! must first pass through the parent.

use crate::debug;
use crate::latch::ExclusiveGuard;
use crate::node::{Node, NodeRef};
use crate::ops::{self, SiblingSide};
use crate::TreeIndex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Concurrent B+ tree using per-node latches and crab latching.
pub struct FineTree<K> {
    dummy: NodeRef<K>,
    order: usize,
    len: AtomicUsize,
}

// SAFETY: all access to the node graph goes through the latching protocol.
unsafe impl<K: Send + Sync> Send for FineTree<K> {}
unsafe impl<K: Send + Sync> Sync for FineTree<K> {}

struct PathEntry<'a, K> {
    node: NodeRef<K>,
    guard: ExclusiveGuard<'a, Node<K>>,
}

enum WritePath<'a, K> {
    /// The tree is empty; the dummy is held exclusively.
    EmptyTree(ExclusiveGuard<'a, Node<K>>),
    /// Latched path ending at the target leaf. May start at the dummy.
    ToLeaf(Vec<PathEntry<'a, K>>),
}

#[derive(Clone, Copy, PartialEq)]
enum WriteMode {
    Insert,
    Delete,
}

impl<K: Clone + Ord> FineTree<K> {
    /// Creates an empty tree with the given branching factor.
    ///
    /// # Panics
    /// Panics if `order < 3`.
    pub fn new(order: usize) -> FineTree<K> {
        assert!(order >= 3, "order must be at least 3");
        FineTree {
            dummy: NodeRef::alloc(true, true),
            order,
            len: AtomicUsize::new(0),
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up `key` with shared lock coupling.
    pub fn get(&self, key: &K) -> Option<K> {
        unsafe {
            let mut guard = self.dummy.latch().shared();
            if guard.children.is_empty() {
                return None;
            }
            loop {
                let next = guard.children[guard.gt_key_index(key)];
                // Acquire the child before releasing the parent.
                let next_guard = next.latch().shared();
                guard = next_guard;
                if guard.is_leaf {
                    break;
                }
            }
            guard.key_position(key).map(|index| guard.keys[index].clone())
        }
    }

    /// Inserts `key`; a key already present is left untouched.
    pub fn insert(&self, key: K) {
        unsafe {
            match self.write_descend(&key, WriteMode::Insert) {
                WritePath::EmptyTree(mut dummy_guard) => {
                    let leaf: NodeRef<K> = NodeRef::alloc(true, false);
                    leaf.latch().exclusive().keys.push(key);
                    dummy_guard.children.push(leaf);
                    dummy_guard.is_leaf = false;
                    dummy_guard.consolidate_children(self.dummy);
                    self.len.fetch_add(1, Ordering::Relaxed);
                }
                WritePath::ToLeaf(mut path) => {
                    let leaf_entry = path.last_mut().expect("path ends at the leaf");
                    if !ops::insert_into_leaf(leaf_entry.guard.as_mut(), key) {
                        return;
                    }
                    self.len.fetch_add(1, Ordering::Relaxed);

                    let mut index = path.len() - 1;
                    loop {
                        if !path[index].guard.is_full(self.order) {
                            break;
                        }
                        let (upper, lower) = path.split_at_mut(index);
                        let parent_entry = upper
                            .last_mut()
                            .expect("a full node keeps its parent latched");
                        let node_entry = &mut lower[0];
                        let parent_full = ops::split_step(
                            self.order,
                            node_entry.node,
                            node_entry.guard.as_mut(),
                            parent_entry.node,
                            parent_entry.guard.as_mut(),
                        );
                        if !parent_full {
                            break;
                        }
                        index -= 1;
                    }
                    // Dropping the vector releases the queue front to back.
                    drop(path);
                }
            }
        }
    }

    /// Removes `key`, reporting whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        unsafe {
            let mut path = match self.write_descend(key, WriteMode::Delete) {
                WritePath::EmptyTree(_) => return false,
                WritePath::ToLeaf(path) => path,
            };

            {
                let leaf_entry = path.last_mut().expect("path ends at the leaf");
                if !ops::remove_from_leaf(leaf_entry.guard.as_mut(), key) {
                    return false;
                }
            }
            self.len.fetch_sub(1, Ordering::Relaxed);

            let mut index = path.len() - 1;
            loop {
                if index == 0 {
                    // The queue root was safe at descent time; nothing above
                    // it can be affected.
                    break;
                }
                let parent_is_dummy = path[index - 1].guard.is_dummy;
                if parent_is_dummy {
                    if path[index].guard.num_keys() > 0 {
                        break;
                    }
                    let is_leaf = path[index].guard.is_leaf;
                    let (upper, lower) = path.split_at_mut(index);
                    let dummy_entry = upper.last_mut().expect("dummy entry");
                    let root_entry = &mut lower[0];
                    let freed = if is_leaf {
                        // Last key of the tree was removed.
                        dummy_entry.guard.children.clear();
                        dummy_entry.guard.is_leaf = true;
                        root_entry.node
                    } else {
                        ops::promote_root_child(
                            dummy_entry.node,
                            dummy_entry.guard.as_mut(),
                            root_entry.node,
                            root_entry.guard.as_mut(),
                        )
                    };
                    path.truncate(index);
                    freed.free();
                    break;
                }

                if ops::is_half_full(&path[index].guard, self.order) {
                    break;
                }

                let (upper, lower) = path.split_at_mut(index);
                let parent_entry = upper
                    .last_mut()
                    .expect("an underfull node keeps its parent latched");
                let node_entry = &mut lower[0];
                let child_index = node_entry.node.child_index();
                let side = if child_index > 0 {
                    SiblingSide::Left
                } else {
                    SiblingSide::Right
                };
                let sibling = match side {
                    SiblingSide::Left => parent_entry.guard.children[child_index - 1],
                    SiblingSide::Right => parent_entry.guard.children[child_index + 1],
                };
                let mut sibling_guard = sibling.latch().exclusive();

                if ops::more_half_full(&sibling_guard, self.order) {
                    match side {
                        SiblingSide::Left => ops::borrow_from_left(
                            node_entry.node,
                            node_entry.guard.as_mut(),
                            sibling,
                            &mut sibling_guard,
                            parent_entry.guard.as_mut(),
                        ),
                        SiblingSide::Right => ops::borrow_from_right(
                            node_entry.node,
                            node_entry.guard.as_mut(),
                            sibling,
                            &mut sibling_guard,
                            parent_entry.guard.as_mut(),
                        ),
                    }
                    break;
                }

                let outcome = ops::merge_step(
                    self.order,
                    node_entry.node,
                    node_entry.guard.as_mut(),
                    sibling,
                    &mut sibling_guard,
                    side,
                    parent_entry.node,
                    parent_entry.guard.as_mut(),
                );
                drop(sibling_guard);
                path.truncate(index);
                outcome.freed.free();
                index -= 1;
            }

            drop(path);
            true
        }
    }

    /// All keys in ascending order. Takes `&mut self` because the walk
    /// requires a quiescent tree.
    pub fn to_vec(&mut self) -> Vec<K> {
        unsafe {
            let mut out = Vec::with_capacity(self.len());
            let mut cur = self.dummy;
            loop {
                let g = cur.latch().shared();
                if g.is_leaf {
                    break;
                }
                cur = g.children[0];
            }
            if cur == self.dummy {
                return out;
            }
            let mut walker = Some(cur);
            while let Some(node) = walker {
                out.extend(node.latch().shared().keys.iter().cloned());
                walker = node.next();
            }
            out
        }
    }

    /// Descends with exclusive latches, retaining ancestors of unsafe nodes.
    unsafe fn write_descend(&self, key: &K, mode: WriteMode) -> WritePath<'_, K> {
        let dummy = self.dummy;
        loop {
            let dummy_shared = dummy.latch().shared();
            if dummy_shared.children.is_empty() {
                drop(dummy_shared);
                let dummy_guard = dummy.latch().exclusive();
                if dummy_guard.children.is_empty() {
                    return WritePath::EmptyTree(dummy_guard);
                }
                // Another writer installed the first leaf; start over.
                continue;
            }
            let root = dummy_shared.children[0];
            let root_guard = root.latch().exclusive();
            drop(dummy_shared);

            let mut path: Vec<PathEntry<'_, K>> = Vec::new();
            if self.is_safe(&root_guard, mode, true) {
                path.push(PathEntry {
                    node: root,
                    guard: root_guard,
                });
            } else {
                // The root pointer itself may have to change; re-enter with
                // the tree latch held.
                drop(root_guard);
                let dummy_guard = dummy.latch().exclusive();
                if dummy_guard.children.is_empty() {
                    return WritePath::EmptyTree(dummy_guard);
                }
                let root = dummy_guard.children[0];
                let root_guard = root.latch().exclusive();
                if self.is_safe(&root_guard, mode, true) {
                    path.push(PathEntry {
                        node: root,
                        guard: root_guard,
                    });
                } else {
                    path.push(PathEntry {
                        node: dummy,
                        guard: dummy_guard,
                    });
                    path.push(PathEntry {
                        node: root,
                        guard: root_guard,
                    });
                }
            }

            loop {
                if path.last().expect("path is never empty").guard.is_leaf {
                    return WritePath::ToLeaf(path);
                }
                let next = {
                    let g = &path.last().expect("path is never empty").guard;
                    g.children[g.gt_key_index(key)]
                };
                let next_guard = next.latch().exclusive();
                if self.is_safe(&next_guard, mode, false) {
                    // Ancestors can no longer be affected; release the whole
                    // queue, oldest latch first.
                    path.drain(..);
                }
                path.push(PathEntry {
                    node: next,
                    guard: next_guard,
                });
            }
        }
    }

    /// True when the node absorbs the operation without touching its parent.
    fn is_safe(&self, node: &Node<K>, mode: WriteMode, is_root: bool) -> bool {
        match mode {
            WriteMode::Insert => node.num_keys() < self.order - 1,
            WriteMode::Delete => {
                if is_root {
                    // The root only changes identity once it is down to its
                    // last key (leaf) or last separator (internal).
                    node.num_keys() > 1
                } else {
                    node.num_keys() > (self.order - 1) / 2
                }
            }
        }
    }
}

impl<K: Clone + Ord + fmt::Debug> FineTree<K> {
    /// Validates every structural invariant; requires a quiescent tree.
    pub fn check_invariants(&mut self) {
        unsafe {
            debug::validate(
                self.dummy,
                self.order,
                (self.order - 1) / 2,
                false,
                self.len(),
            );
        }
    }

    /// Renders the tree level by level, serialized by the global print lock.
    pub fn debug_print(&mut self) {
        let _guard = debug::print_lock().lock();
        eprintln!("{}", unsafe { debug::render(self.dummy) });
    }
}

impl<K> Drop for FineTree<K> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no client holds latches; the dummy owns
        // the whole graph.
        unsafe {
            self.dummy.release_subtree();
        }
    }
}

impl<K: Clone + Ord> TreeIndex<K> for FineTree<K> {
    fn insert(&self, key: K) {
        FineTree::insert(self, key);
    }

    fn remove(&self, key: &K) -> bool {
        FineTree::remove(self, key)
    }

    fn get(&self, key: &K) -> Option<K> {
        FineTree::get(self, key)
    }

    fn size(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_behaviour() {
        let mut tree: FineTree<i64> = FineTree::new(3);
        assert_eq!(tree.get(&1), None);
        assert!(!tree.remove(&1));
        assert_eq!(tree.len(), 0);
        tree.check_invariants();
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let mut tree = FineTree::new(3);
        for key in [10, 20, 5, 6, 12, 30, 7, 17] {
            tree.insert(key);
            tree.check_invariants();
        }
        assert_eq!(tree.get(&12), Some(12));
        assert_eq!(tree.get(&99), None);
        for key in [10, 5, 20, 30] {
            assert!(tree.remove(&key));
            tree.check_invariants();
        }
        assert_eq!(tree.to_vec(), vec![6, 7, 12, 17]);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let mut tree = FineTree::new(3);
        tree.insert(5);
        tree.insert(5);
        assert_eq!(tree.len(), 1);
        tree.check_invariants();
    }

    #[test]
    fn larger_order_bulk_roundtrip() {
        let mut tree = FineTree::new(6);
        for key in 0..500 {
            tree.insert(key);
        }
        tree.check_invariants();
        assert_eq!(tree.len(), 500);
        for key in (0..500).step_by(2) {
            assert!(tree.remove(&key));
        }
        tree.check_invariants();
        let expected: Vec<i64> = (0..500).filter(|k| k % 2 == 1).collect();
        assert_eq!(tree.to_vec(), expected);
    }

    #[test]
    fn drain_to_empty() {
        let mut tree = FineTree::new(3);
        for key in 0..32 {
            tree.insert(key);
        }
        for key in 0..32 {
            assert!(tree.remove(&key));
            tree.check_invariants();
        }
        assert!(tree.is_empty());
        assert_eq!(tree.get(&0), None);
    }
}
