//! Sequential rebalancing kernel.
//!
//! These functions perform the node-graph surgery for insert and delete:
//! splitting a full node, borrowing through the parent separator, merging
//! same-parent siblings and promoting the root's lone child. They assume the
//! caller has exclusive access to every node they receive; the sequential
//! tree gets that for free, the latched tree establishes it with its latch
//! queue before calling in.
//!
//! Each function performs exactly one level of work and reports whether the
//! parent may need attention, so callers can interleave latch management with
//! the upward propagation.
//!
//! Splits place the new sibling *left* of the split node when that node is
//! the rightmost child of a non-dummy parent, and *right* of it otherwise.
//! This keeps every pointer the split touches (separator slot, sibling list
//! splice) inside the subtree of the already-held parent.

use crate::node::{Node, NodeRef};

/// Which side of a node its rebalancing partner sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SiblingSide {
    Left,
    Right,
}

/// Result of [`merge_step`].
pub(crate) struct MergeOutcome<K> {
    /// The emptied node, already unlinked from the parent and the sibling
    /// list. The caller drops its guards before freeing it.
    pub(crate) freed: NodeRef<K>,
    /// True when the parent lost a key and dropped below half full.
    pub(crate) parent_underfull: bool,
}

/// Minimum-occupancy predicate used by the sequential and latched engines.
///
/// The floor is `(order - 1) / 2` rather than `order / 2`: with the larger
/// floor an internal merge of an underfull node, an exactly-half sibling and
/// the pulled-down separator can reach `order` keys at even orders, which
/// would leave a full node behind with nothing scheduled to split it.
#[inline]
pub(crate) fn is_half_full<K>(node: &Node<K>, order: usize) -> bool {
    node.num_keys() >= (order - 1) / 2
}

/// True when the node can give up a key without becoming underfull.
#[inline]
pub(crate) fn more_half_full<K>(node: &Node<K>, order: usize) -> bool {
    node.num_keys() > (order - 1) / 2
}

/// Inserts `key` into a leaf, keeping keys strictly ascending.
///
/// Returns false (leaving the leaf untouched) when the key is already
/// present; the tree stores each key once.
pub(crate) fn insert_into_leaf<K: Ord>(leaf: &mut Node<K>, key: K) -> bool {
    debug_assert!(leaf.is_leaf);
    let index = leaf.gt_key_index(&key);
    if index > 0 && leaf.keys[index - 1] == key {
        return false;
    }
    leaf.keys.insert(index, key);
    true
}

/// Removes `key` from a leaf if present.
pub(crate) fn remove_from_leaf<K: Ord>(leaf: &mut Node<K>, key: &K) -> bool {
    match leaf.key_position(key) {
        Some(index) => {
            leaf.keys.remove(index);
            true
        }
        None => false,
    }
}

/// Splits the full `node`, registering the new sibling and separator with
/// `parent`. When `parent` is the dummy, a new real root is created instead.
///
/// Returns true when the parent itself is now full and must be split next.
///
/// # Safety
/// The caller must have exclusive structural access to `node`, `parent` and
/// (transitively through the parent) the sibling adjacent to `node` on the
/// placement side.
pub(crate) unsafe fn split_step<K: Clone + Ord>(
    order: usize,
    node_ref: NodeRef<K>,
    node: &mut Node<K>,
    parent_ref: NodeRef<K>,
    parent: &mut Node<K>,
) -> bool {
    debug_assert!(node.is_full(order));

    let new_ref: NodeRef<K> = NodeRef::alloc(node.is_leaf, false);
    let middle = node.num_keys() / 2;
    let mid_key = node.keys[middle].clone();

    let new_on_right = parent.is_dummy || node_ref.child_index() != parent.num_children() - 1;

    {
        let mut new_node = new_ref.latch().exclusive();
        if node.is_leaf {
            if new_on_right {
                new_node.keys.extend(node.keys.drain(middle..));
            } else {
                new_node.keys.extend(node.keys.drain(..middle));
            }
        } else {
            if new_on_right {
                new_node.keys.extend(node.keys.drain(middle + 1..));
                node.keys.truncate(middle);
                new_node.children.extend(node.children.drain(middle + 1..));
            } else {
                new_node.keys.extend(node.keys.drain(..middle));
                node.keys.remove(0);
                new_node.children.extend(node.children.drain(..middle + 1));
            }
            new_node.consolidate_children(new_ref);
            node.consolidate_children(node_ref);
        }
    }

    if parent.is_dummy {
        // The real root split; grow the tree by one level.
        debug_assert!(new_on_right);
        let root_ref: NodeRef<K> = NodeRef::alloc(false, false);
        {
            let mut root = root_ref.latch().exclusive();
            root.keys.push(mid_key);
            root.children.push(node_ref);
            root.children.push(new_ref);
            root.consolidate_children(root_ref);
        }
        node_ref.set_prev(None);
        node_ref.set_next(Some(new_ref));
        new_ref.set_prev(Some(node_ref));
        new_ref.set_next(None);
        root_ref.set_parent(Some(parent_ref));
        root_ref.set_child_index(0);
        parent.children[0] = root_ref;
        false
    } else {
        let index = node_ref.child_index();
        parent.keys.insert(index, mid_key);
        if new_on_right {
            parent.children.insert(index + 1, new_ref);
            node_ref.link_after(new_ref);
        } else {
            parent.children.insert(index, new_ref);
            node_ref.link_before(new_ref);
        }
        parent.consolidate_children(parent_ref);
        parent.is_full(order)
    }
}

/// Rotates one key from `left` into `node` through the parent separator.
///
/// # Safety
/// Caller has exclusive structural access to all three nodes.
pub(crate) unsafe fn borrow_from_left<K: Clone + Ord>(
    node_ref: NodeRef<K>,
    node: &mut Node<K>,
    left_ref: NodeRef<K>,
    left: &mut Node<K>,
    parent: &mut Node<K>,
) {
    let index = left_ref.child_index();
    if node.is_leaf {
        let moved = left.keys.pop().expect("left sibling has a key to give");
        parent.keys[index] = moved.clone();
        node.keys.insert(0, moved);
    } else {
        let from_sibling = left.keys.pop().expect("left sibling has a key to give");
        let from_parent = std::mem::replace(&mut parent.keys[index], from_sibling);
        node.keys.insert(0, from_parent);
        let child = left.children.pop().expect("internal sibling has a child");
        node.children.insert(0, child);
        node.consolidate_children(node_ref);
    }
}

/// Rotates one key from `right` into `node` through the parent separator.
///
/// # Safety
/// Caller has exclusive structural access to all three nodes.
pub(crate) unsafe fn borrow_from_right<K: Clone + Ord>(
    node_ref: NodeRef<K>,
    node: &mut Node<K>,
    right_ref: NodeRef<K>,
    right: &mut Node<K>,
    parent: &mut Node<K>,
) {
    let index = node_ref.child_index();
    if node.is_leaf {
        node.keys.push(right.keys.remove(0));
        parent.keys[index] = right.keys[0].clone();
    } else {
        let from_sibling = right.keys.remove(0);
        let from_parent = std::mem::replace(&mut parent.keys[index], from_sibling);
        node.keys.push(from_parent);
        node.children.push(right.children.remove(0));
        node.consolidate_children(node_ref);
        right.consolidate_children(right_ref);
    }
}

/// Coalesces `node` with its same-parent sibling `sib`.
///
/// The surviving side is chosen so the modification stays inside the subtree
/// already held by the caller: with two children under the parent the
/// direction follows the parent's own position, otherwise the leftmost node
/// of the pair survives only when `node` is the leftmost child.
///
/// # Safety
/// Caller has exclusive structural access to `node`, `sib` and `parent`, and
/// frees the returned node only after dropping its guards.
pub(crate) unsafe fn merge_step<K: Clone + Ord>(
    order: usize,
    node_ref: NodeRef<K>,
    node: &mut Node<K>,
    sib_ref: NodeRef<K>,
    sib: &mut Node<K>,
    side: SiblingSide,
    parent_ref: NodeRef<K>,
    parent: &mut Node<K>,
) -> MergeOutcome<K> {
    let (left_ref, left, right_ref, right) = match side {
        SiblingSide::Left => (sib_ref, sib, node_ref, node),
        SiblingSide::Right => (node_ref, node, sib_ref, sib),
    };

    let left_merge_to_right = if parent.num_children() == 2 {
        parent_ref.child_index() != 0
    } else {
        // With three or more children the vanishing node is never an
        // endpoint of the parent's child list.
        side == SiblingSide::Left
    };

    let index = left_ref.child_index();
    debug_assert_eq!(index + 1, right_ref.child_index());

    let freed = if left_merge_to_right {
        if !left.is_leaf {
            right.keys.insert(0, parent.keys[index].clone());
            for (offset, child) in left.children.drain(..).enumerate() {
                right.children.insert(offset, child);
            }
        }
        parent.keys.remove(index);
        parent.children.remove(index);
        for (offset, key) in left.keys.drain(..).enumerate() {
            right.keys.insert(offset, key);
        }
        right.consolidate_children(right_ref);
        left_ref.unlink();
        left_ref
    } else {
        if !right.is_leaf {
            left.keys.push(parent.keys[index].clone());
            left.children.extend(right.children.drain(..));
        }
        parent.keys.remove(index);
        parent.children.remove(index + 1);
        left.keys.extend(right.keys.drain(..));
        left.consolidate_children(left_ref);
        right_ref.unlink();
        right_ref
    };
    parent.consolidate_children(parent_ref);

    MergeOutcome {
        freed,
        parent_underfull: !is_half_full(parent, order),
    }
}

/// Replaces an exhausted internal root (zero keys, one child) with its lone
/// child. Returns the old root for the caller to free.
///
/// # Safety
/// Caller has exclusive structural access to the dummy and the root.
pub(crate) unsafe fn promote_root_child<K>(
    dummy_ref: NodeRef<K>,
    dummy: &mut Node<K>,
    root_ref: NodeRef<K>,
    root: &mut Node<K>,
) -> NodeRef<K> {
    debug_assert!(!root.is_leaf);
    debug_assert_eq!(root.num_keys(), 0);
    debug_assert_eq!(root.num_children(), 1);

    let child = root.children[0];
    dummy.children[0] = child;
    child.set_parent(Some(dummy_ref));
    child.set_child_index(0);
    root.children.clear();
    root_ref
}
