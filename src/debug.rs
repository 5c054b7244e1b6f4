//! Structural self-checks and diagnostics.
//!
//! [`validate`] walks a quiesced tree and panics on the first violated
//! invariant: key ordering with per-subtree bounds, parent/child-index
//! agreement, arity rules, per-level sibling chains, cached minima (batched
//! variant) and the size accounting against the leaf key count.
//!
//! [`render`] produces the level-by-level dump the checker prints on
//! failure. Printing is serialized through a process-wide lock so concurrent
//! diagnostics do not interleave.

use crate::node::NodeRef;
use parking_lot::Mutex;
use std::fmt::{Debug, Write};
use std::sync::OnceLock;

static PRINT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Process-wide lock serializing debug output.
pub(crate) fn print_lock() -> &'static Mutex<()> {
    PRINT_LOCK.get_or_init(|| Mutex::new(()))
}

/// Validates every structural invariant of the tree hanging off `dummy`.
///
/// # Safety
/// The tree must be quiescent: no concurrent mutation for the duration of
/// the walk, and every reachable node live.
pub(crate) unsafe fn validate<K: Clone + Ord + Debug>(
    dummy: NodeRef<K>,
    order: usize,
    min_keys: usize,
    check_min: bool,
    expected_len: usize,
) {
    let root = {
        let d = dummy.latch().shared();
        assert!(d.is_dummy, "root holder must be the dummy sentinel");
        assert!(d.keys.is_empty(), "dummy must not hold keys");
        assert!(d.num_children() <= 1, "dummy has at most one child");
        if d.children.is_empty() {
            assert!(d.is_leaf, "childless dummy must read as a leaf");
            assert_eq!(expected_len, 0, "empty tree must report size 0");
            return;
        }
        assert!(!d.is_leaf, "dummy with a child must not read as a leaf");
        d.children[0]
    };

    assert_eq!(root.parent(), Some(dummy), "root must point back at dummy");
    assert_eq!(root.child_index(), 0);
    check_node(root, None, None, true, order, min_keys, check_min);

    // Sibling chains, level by level.
    let mut level_head = root;
    loop {
        check_chain(level_head);
        let g = level_head.latch().shared();
        if g.is_leaf {
            break;
        }
        let next = g.children[0];
        drop(g);
        level_head = next;
    }

    // Leaf-level ordering and size accounting.
    let mut count = 0usize;
    let mut last: Option<K> = None;
    let mut walker = Some(level_head);
    while let Some(node) = walker {
        let g = node.latch().shared();
        for key in &g.keys {
            if let Some(prev) = &last {
                assert!(prev < key, "leaf walk not ascending: {prev:?} then {key:?}");
            }
            last = Some(key.clone());
            count += 1;
        }
        walker = node.next();
    }
    assert_eq!(
        count, expected_len,
        "size() disagrees with leaf key count"
    );
}

unsafe fn check_node<K: Clone + Ord + Debug>(
    node: NodeRef<K>,
    lower: Option<K>,
    upper: Option<K>,
    is_root: bool,
    order: usize,
    min_keys: usize,
    check_min: bool,
) {
    let g = node.latch().shared();

    for pair in g.keys.windows(2) {
        assert!(
            pair[0] < pair[1],
            "keys not strictly ascending: {:?} then {:?}",
            pair[0],
            pair[1]
        );
    }
    for key in &g.keys {
        if let Some(lo) = &lower {
            assert!(key >= lo, "key {key:?} below subtree lower bound {lo:?}");
        }
        if let Some(hi) = &upper {
            assert!(key < hi, "key {key:?} at or above subtree upper bound {hi:?}");
        }
    }

    assert!(g.num_keys() < order, "node holds {} keys at order {order}", g.num_keys());
    if !is_root {
        assert!(
            g.num_keys() >= min_keys,
            "non-root node holds {} keys, minimum is {min_keys}",
            g.num_keys()
        );
    }

    if g.is_leaf {
        assert!(g.children.is_empty(), "leaf must not have children");
        if check_min {
            if let Some(first) = g.keys.first() {
                assert_eq!(
                    g.min_elem.as_ref(),
                    Some(first),
                    "leaf min cache out of date"
                );
            }
        }
        return;
    }

    assert!(g.num_keys() >= 1, "internal node must hold a key");
    assert_eq!(
        g.num_children(),
        g.num_keys() + 1,
        "internal node child count must be keys + 1"
    );
    if check_min {
        let min = subtree_min(node);
        assert_eq!(
            g.min_elem.as_ref(),
            Some(&min),
            "internal min cache out of date"
        );
    }

    for (index, &child) in g.children.iter().enumerate() {
        assert_eq!(
            child.parent(),
            Some(node),
            "child {index} does not point back at its parent"
        );
        assert_eq!(child.child_index(), index, "child index hint out of date");
        let lo = if index == 0 {
            lower.clone()
        } else {
            Some(g.keys[index - 1].clone())
        };
        let hi = if index == g.num_children() - 1 {
            upper.clone()
        } else {
            Some(g.keys[index].clone())
        };
        check_node(child, lo, hi, false, order, min_keys, check_min);
    }
}

unsafe fn check_chain<K: Clone + Ord + Debug>(head: NodeRef<K>) {
    assert_eq!(head.prev(), None, "level head must have no predecessor");
    let mut cur = head;
    while let Some(next) = cur.next() {
        assert_eq!(
            next.prev(),
            Some(cur),
            "sibling chain backlink broken"
        );
        let left_last = cur.latch().shared().keys.last().cloned();
        let right_first = next.latch().shared().keys.first().cloned();
        if let (Some(l), Some(r)) = (left_last, right_first) {
            assert!(l < r, "sibling chain not ordered: {l:?} before {r:?}");
        }
        cur = next;
    }
}

unsafe fn subtree_min<K: Clone + Ord>(node: NodeRef<K>) -> K {
    let mut cur = node;
    loop {
        let g = cur.latch().shared();
        if g.is_leaf {
            return g.keys.first().expect("leaf on min path has a key").clone();
        }
        cur = g.children[0];
    }
}

/// Renders the tree level by level, leftmost node first on each line.
///
/// # Safety
/// Same quiescence requirement as [`validate`].
pub(crate) unsafe fn render<K: Debug>(dummy: NodeRef<K>) -> String {
    let mut out = String::new();
    let d = dummy.latch().shared();
    if d.children.is_empty() {
        out.push_str("(empty)\n");
        return out;
    }
    let mut level_head = d.children[0];
    drop(d);
    let mut level = 0usize;
    loop {
        let _ = write!(out, "{level}\t| ");
        let mut walker = Some(level_head);
        while let Some(node) = walker {
            let g = node.latch().shared();
            let _ = write!(out, "{:?}", g.keys.as_slice());
            walker = node.next();
            if walker.is_some() {
                out.push_str("<->");
            }
        }
        out.push('\n');
        let g = level_head.latch().shared();
        if g.is_leaf {
            break;
        }
        let next = g.children[0];
        drop(g);
        level_head = next;
        level += 1;
    }
    out
}
