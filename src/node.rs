//! The node model shared by every tree engine.
//!
//! Nodes are heap allocations reachable through [`NodeRef`], a copyable
//! non-owning pointer. Each allocation couples two regions with different
//! access rules:
//!
//! * the **payload** ([`Node`]): keys, child list, leaf/dummy flags and the
//!   cached subtree minimum, protected by the node's [`Latch`];
//! * the **links**: parent pointer, `child_index` hint and the doubly linked
//!   sibling list, stored as atomics so they can be repaired while holding
//!   only the *parent's* latch (or while owning the node's subtree in a
//!   batched execution stage).
//!
//! Ownership is tree-shaped: every node is owned by the `children` entry of
//! its parent, with the dummy root owned by the tree handle itself. Links are
//! non-owning. A node is freed either when a merge removes it from its parent
//! (the freeing thread holds the parent exclusively, so no other thread can
//! still reach it) or when the whole tree is dropped.

use crate::latch::Latch;
use smallvec::SmallVec;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Inline capacity for key and child storage; nodes spill to the heap past
/// this, which only happens for orders above the inline size.
const INLINE: usize = 8;

pub(crate) type KeyVec<K> = SmallVec<[K; INLINE]>;
pub(crate) type ChildVec<K> = SmallVec<[NodeRef<K>; INLINE]>;

/// Latch-protected node payload.
pub(crate) struct Node<K> {
    pub(crate) is_leaf: bool,
    pub(crate) is_dummy: bool,
    /// Strictly ascending.
    pub(crate) keys: KeyVec<K>,
    /// Empty for leaves; `keys.len() + 1` entries for internal nodes.
    pub(crate) children: ChildVec<K>,
    /// Cached minimum key of this subtree. Maintained by the batched engine
    /// only; left stale on empty nodes until the next rebuild repairs it.
    pub(crate) min_elem: Option<K>,
}

impl<K> Node<K> {
    pub(crate) fn new(is_leaf: bool, is_dummy: bool) -> Node<K> {
        Node {
            is_leaf,
            is_dummy,
            keys: SmallVec::new(),
            children: SmallVec::new(),
            min_elem: None,
        }
    }
}

impl<K: Ord> Node<K> {
    /// Smallest index `i` with `keys[i] > key`, or `keys.len()` if no key is
    /// greater. Routing descent follows `children[gt_key_index(key)]`, which
    /// sends keys equal to a separator into the right-hand subtree. On the
    /// keyless dummy this is always 0.
    #[inline]
    pub(crate) fn gt_key_index(&self, key: &K) -> usize {
        self.keys.partition_point(|k| k <= key)
    }

    /// Position of `key` in this node's key list, if present.
    #[inline]
    pub(crate) fn key_position(&self, key: &K) -> Option<usize> {
        self.keys.binary_search(key).ok()
    }
}

impl<K> Node<K> {
    #[inline]
    pub(crate) fn num_keys(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub(crate) fn num_children(&self) -> usize {
        self.children.len()
    }

    /// A node at or past `order` keys must split before the operation ends.
    #[inline]
    pub(crate) fn is_full(&self, order: usize) -> bool {
        self.keys.len() >= order
    }
}

impl<K: Clone> Node<K> {
    /// Recomputes the cached subtree minimum from the first key (leaves) or
    /// the first child's cached minimum (internal nodes).
    ///
    /// An empty node keeps its previous value; the stale minimum is tolerated
    /// because an empty node is merged away before the next rebuild reads it.
    ///
    /// Caller must not hold a guard on `children[0]`.
    pub(crate) unsafe fn update_min(&mut self) {
        if self.is_leaf {
            if let Some(first) = self.keys.first() {
                self.min_elem = Some(first.clone());
            }
        } else if let Some(&first) = self.children.first() {
            let child = first.latch().shared();
            if child.min_elem.is_some() {
                self.min_elem = child.min_elem.clone();
            }
        }
    }
}

impl<K> Node<K> {
    /// Rewrites `parent` and `child_index` on every child to point back at
    /// `this`. Called after any mutation of `children`.
    ///
    /// Only touches the children's atomic links, so holding `this`
    /// exclusively (or owning its subtree in a batched stage) is sufficient.
    pub(crate) unsafe fn consolidate_children(&self, this: NodeRef<K>) {
        for (index, child) in self.children.iter().enumerate() {
            child.set_parent(Some(this));
            child.set_child_index(index);
        }
    }
}

/// Link block; every field is repaired in place under the owning discipline.
struct Links<K> {
    parent: AtomicPtr<NodeBox<K>>,
    prev: AtomicPtr<NodeBox<K>>,
    next: AtomicPtr<NodeBox<K>>,
    child_index: AtomicUsize,
}

/// The heap allocation unit: latch-protected payload plus link block.
pub(crate) struct NodeBox<K> {
    pub(crate) latch: Latch<Node<K>>,
    links: Links<K>,
}

/// Copyable non-owning reference to a node allocation.
///
/// # Validity
///
/// A `NodeRef` dangles once the node is freed, so all dereferencing methods
/// are `unsafe`. The engines keep them valid by construction: merges free a
/// node only while holding its parent exclusively (latched engine) or while
/// owning the parent's subtree within a stage (batched engine), and no other
/// thread can reach the node without first passing that parent.
pub(crate) struct NodeRef<K>(NonNull<NodeBox<K>>);

impl<K> Clone for NodeRef<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for NodeRef<K> {}

impl<K> PartialEq for NodeRef<K> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<K> Eq for NodeRef<K> {}

impl<K> std::hash::Hash for NodeRef<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<K> fmt::Debug for NodeRef<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeRef({:p})", self.0.as_ptr())
    }
}

// SAFETY: a NodeRef is a plain pointer; the latch and the engine disciplines
// provide the synchronization for everything reachable through it.
unsafe impl<K: Send + Sync> Send for NodeRef<K> {}
unsafe impl<K: Send + Sync> Sync for NodeRef<K> {}

impl<K> NodeRef<K> {
    /// Allocates a fresh unlinked node.
    pub(crate) fn alloc(is_leaf: bool, is_dummy: bool) -> NodeRef<K> {
        let boxed = Box::new(NodeBox {
            latch: Latch::new(Node::new(is_leaf, is_dummy)),
            links: Links {
                parent: AtomicPtr::new(std::ptr::null_mut()),
                prev: AtomicPtr::new(std::ptr::null_mut()),
                next: AtomicPtr::new(std::ptr::null_mut()),
                child_index: AtomicUsize::new(0),
            },
        });
        // SAFETY: Box::into_raw never returns null.
        NodeRef(unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) })
    }
}

impl<K> NodeRef<K> {
    /// Stable address for hashing and identity checks.
    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    /// The node must not have been freed.
    #[inline]
    pub(crate) unsafe fn latch<'a>(self) -> &'a Latch<Node<K>> {
        &(*self.0.as_ptr()).latch
    }

    /// # Safety
    /// The node must not have been freed.
    #[inline]
    pub(crate) unsafe fn parent(self) -> Option<NodeRef<K>> {
        NodeRef::from_raw((*self.0.as_ptr()).links.parent.load(Ordering::Acquire))
    }

    /// # Safety
    /// The node must not have been freed; the caller must own the link per
    /// the engine discipline (parent latched, or stage ownership).
    #[inline]
    pub(crate) unsafe fn set_parent(self, parent: Option<NodeRef<K>>) {
        (*self.0.as_ptr())
            .links
            .parent
            .store(NodeRef::into_raw(parent), Ordering::Release);
    }

    /// # Safety
    /// The node must not have been freed.
    #[inline]
    pub(crate) unsafe fn prev(self) -> Option<NodeRef<K>> {
        NodeRef::from_raw((*self.0.as_ptr()).links.prev.load(Ordering::Acquire))
    }

    /// # Safety
    /// See [`NodeRef::set_parent`].
    #[inline]
    pub(crate) unsafe fn set_prev(self, prev: Option<NodeRef<K>>) {
        (*self.0.as_ptr())
            .links
            .prev
            .store(NodeRef::into_raw(prev), Ordering::Release);
    }

    /// # Safety
    /// The node must not have been freed.
    #[inline]
    pub(crate) unsafe fn next(self) -> Option<NodeRef<K>> {
        NodeRef::from_raw((*self.0.as_ptr()).links.next.load(Ordering::Acquire))
    }

    /// # Safety
    /// See [`NodeRef::set_parent`].
    #[inline]
    pub(crate) unsafe fn set_next(self, next: Option<NodeRef<K>>) {
        (*self.0.as_ptr())
            .links
            .next
            .store(NodeRef::into_raw(next), Ordering::Release);
    }

    /// # Safety
    /// The node must not have been freed.
    #[inline]
    pub(crate) unsafe fn child_index(self) -> usize {
        (*self.0.as_ptr()).links.child_index.load(Ordering::Acquire)
    }

    /// # Safety
    /// See [`NodeRef::set_parent`].
    #[inline]
    pub(crate) unsafe fn set_child_index(self, index: usize) {
        (*self.0.as_ptr())
            .links
            .child_index
            .store(index, Ordering::Release);
    }

    /// Splices `new` into the sibling list immediately after `self`.
    ///
    /// # Safety
    /// Both nodes must be live; the caller must hold the structural access
    /// that protects this segment of the list.
    pub(crate) unsafe fn link_after(self, new: NodeRef<K>) {
        let old_next = self.next();
        new.set_prev(Some(self));
        new.set_next(old_next);
        self.set_next(Some(new));
        if let Some(n) = old_next {
            n.set_prev(Some(new));
        }
    }

    /// Splices `new` into the sibling list immediately before `self`.
    ///
    /// # Safety
    /// See [`NodeRef::link_after`].
    pub(crate) unsafe fn link_before(self, new: NodeRef<K>) {
        let old_prev = self.prev();
        new.set_next(Some(self));
        new.set_prev(old_prev);
        self.set_prev(Some(new));
        if let Some(p) = old_prev {
            p.set_next(Some(new));
        }
    }

    /// Removes `self` from the sibling list, connecting its neighbors.
    ///
    /// # Safety
    /// See [`NodeRef::link_after`].
    pub(crate) unsafe fn unlink(self) {
        let prev = self.prev();
        let next = self.next();
        if let Some(p) = prev {
            p.set_next(next);
        }
        if let Some(n) = next {
            n.set_prev(prev);
        }
    }

    /// Frees this node's allocation.
    ///
    /// # Safety
    /// No other thread may be able to reach the node, no guard on its latch
    /// may be alive, and the caller must not use any copy of this reference
    /// afterwards. Children are not freed.
    pub(crate) unsafe fn free(self) {
        drop(Box::from_raw(self.0.as_ptr()));
    }

    /// Frees this node and every node below it.
    ///
    /// # Safety
    /// Same as [`NodeRef::free`], extended to the whole subtree.
    pub(crate) unsafe fn release_subtree(self) {
        let boxed = Box::from_raw(self.0.as_ptr());
        for &child in boxed.latch.shared().children.iter() {
            child.release_subtree();
        }
    }

    #[inline]
    fn from_raw(ptr: *mut NodeBox<K>) -> Option<NodeRef<K>> {
        NonNull::new(ptr).map(NodeRef)
    }

    #[inline]
    fn into_raw(node: Option<NodeRef<K>>) -> *mut NodeBox<K> {
        match node {
            Some(n) => n.0.as_ptr(),
            None => std::ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(keys: &[i64]) -> NodeRef<i64> {
        let node = NodeRef::alloc(true, false);
        unsafe {
            node.latch().exclusive().keys.extend(keys.iter().copied());
        }
        node
    }

    #[test]
    fn gt_key_index_routes_equal_keys_right() {
        let mut node: Node<i64> = Node::new(true, false);
        node.keys.extend([10, 20, 30]);
        assert_eq!(node.gt_key_index(&5), 0);
        assert_eq!(node.gt_key_index(&10), 1);
        assert_eq!(node.gt_key_index(&15), 1);
        assert_eq!(node.gt_key_index(&30), 3);
        assert_eq!(node.gt_key_index(&31), 3);
    }

    #[test]
    fn gt_key_index_on_keyless_node_is_zero() {
        let node: Node<i64> = Node::new(false, true);
        assert_eq!(node.gt_key_index(&42), 0);
    }

    #[test]
    fn consolidate_children_rewrites_backlinks() {
        let parent: NodeRef<i64> = NodeRef::alloc(false, false);
        let a = leaf_with(&[1]);
        let b = leaf_with(&[2]);
        unsafe {
            {
                let mut p = parent.latch().exclusive();
                p.keys.push(2);
                p.children.push(a);
                p.children.push(b);
                p.consolidate_children(parent);
            }
            assert_eq!(a.parent(), Some(parent));
            assert_eq!(b.parent(), Some(parent));
            assert_eq!(a.child_index(), 0);
            assert_eq!(b.child_index(), 1);
            parent.release_subtree();
        }
    }

    #[test]
    fn sibling_splice_and_unlink() {
        let a = leaf_with(&[1]);
        let b = leaf_with(&[2]);
        let c = leaf_with(&[3]);
        unsafe {
            a.link_after(c);
            c.link_before(b);
            assert_eq!(a.next(), Some(b));
            assert_eq!(b.next(), Some(c));
            assert_eq!(c.prev(), Some(b));
            b.unlink();
            assert_eq!(a.next(), Some(c));
            assert_eq!(c.prev(), Some(a));
            a.free();
            b.free();
            c.free();
        }
    }

    #[test]
    fn update_min_leaf_and_internal() {
        let leaf = leaf_with(&[7, 9]);
        let parent: NodeRef<i64> = NodeRef::alloc(false, false);
        unsafe {
            leaf.latch().exclusive().update_min();
            {
                let mut p = parent.latch().exclusive();
                p.children.push(leaf);
                p.update_min();
                assert_eq!(p.min_elem, Some(7));
            }
            parent.release_subtree();
        }
    }

    #[test]
    fn update_min_keeps_stale_value_on_empty_node() {
        let leaf = leaf_with(&[5]);
        unsafe {
            {
                let mut g = leaf.latch().exclusive();
                g.update_min();
                g.keys.clear();
                g.update_min();
                assert_eq!(g.min_elem, Some(5));
            }
            leaf.free();
        }
    }
}
