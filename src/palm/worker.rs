//! Worker side of the batched engine.
//!
//! Each worker runs a small state machine: wait for its gate, read the
//! current stage, process its share of the slots, then arrive at the
//! barrier. Slot striding (`slot % num_workers == id`) plus the
//! coordinator's group-by-node step guarantee that within a stage no node is
//! touched by more than one worker, so workers claim their nodes with
//! non-blocking latch acquisitions and treat failure as a protocol defect.
//!
//! Structural repairs differ from the sequential kernel because a batch can
//! leave a node arbitrarily far from its bounds: splits peel whole
//! node-sized chunks until the bulge is drained, borrows move keys until the
//! receiver is legal, and the parent is rebuilt afterwards from the sibling
//! chain between its first and last children, whose identities survive
//! splits and merges between them.

use super::scheduler::{level_of, stage_of, PalmStage, Shared};
use super::{Request, TreeOp};
use crate::latch::SpinWait;
use crate::node::{Node, NodeRef};
use crate::ops;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::trace;

/// Occupancy floor for the batched engine.
#[inline]
pub(crate) fn palm_half_full<K>(node: &Node<K>, order: usize) -> bool {
    node.num_keys() >= (order - 1) / 2
}

#[inline]
fn palm_more_half_full<K>(node: &Node<K>, order: usize) -> bool {
    node.num_keys() > (order - 1) / 2
}

/// Which side of a full node the peeled sibling lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SplitDirection {
    Left,
    Right,
}

/// Body of a worker thread.
pub(crate) fn worker_loop<K: Clone + Ord + Send + Sync>(shared: Arc<Shared<K>>, id: usize) {
    let mut spin = SpinWait::new();
    loop {
        if shared.terminate.load(Ordering::Acquire) {
            return;
        }
        if shared.bg_move.load(Ordering::Acquire)
            || !shared.worker_gate[id].load(Ordering::Acquire)
        {
            spin.spin();
            continue;
        }
        spin.reset();

        match stage_of(shared.flag.load(Ordering::Acquire)) {
            PalmStage::Search => search_stage(&shared, id),
            PalmStage::ExecLeaf => leaf_stage(&shared, id),
            PalmStage::ExecInternal => internal_stage(&shared, id),
        }

        shared.worker_gate[id].store(false, Ordering::Release);
        shared.barrier.fetch_add(1, Ordering::AcqRel);
    }
}

/// Resolves this worker's share of the batch to target leaves. The tree is
/// not mutated during this stage, so the descent takes only shared latches.
fn search_stage<K: Clone + Ord>(shared: &Shared<K>, id: usize) {
    for index in (id..shared.batch_size).step_by(shared.num_workers) {
        // SAFETY: slot striding gives this worker the slot during SEARCH.
        let request = unsafe { shared.batch.get_mut(index) };
        if matches!(request.op, TreeOp::Insert | TreeOp::Delete | TreeOp::Get) {
            let key = request.key.as_ref().expect("keyed operation");
            request.target = Some(unsafe { find_leaf(shared.dummy, key) });
        }
    }
}

/// Read-only descent from the dummy to the leaf covering `key`. On an empty
/// tree the dummy itself reads as the leaf.
///
/// # Safety
/// Every node on the path must stay live, which the stage protocol ensures.
unsafe fn find_leaf<K: Clone + Ord>(dummy: NodeRef<K>, key: &K) -> NodeRef<K> {
    let mut cur = dummy;
    loop {
        let g = cur.latch().shared();
        if g.is_leaf {
            return cur;
        }
        cur = g.children[g.gt_key_index(key)];
    }
}

/// Applies this worker's leaf groups in batch order.
fn leaf_stage<K: Clone + Ord>(shared: &Shared<K>, id: usize) {
    for index in (id..shared.batch_size).step_by(shared.num_workers) {
        // SAFETY: slot striding gives this worker the slot during EXEC_LEAF.
        let group = unsafe { shared.assign.get_mut(index) };
        if !group.is_empty() {
            unsafe { leaf_execute(shared, group) };
        }
    }
}

/// # Safety
/// The group's leaf (and the dummy, for the empty-tree case) must be owned
/// by this worker under the stage protocol.
unsafe fn leaf_execute<K: Clone + Ord>(shared: &Shared<K>, group: &[Request<K>]) {
    let mut leaf = group[0].target.expect("search stage resolved a leaf");

    if leaf == shared.dummy {
        // Empty tree. All empty-tree requests share one group, so this
        // worker owns the dummy here.
        if !group.iter().any(|r| r.op == TreeOp::Insert) {
            for request in group {
                request.reply(None);
            }
            return;
        }
        let first: NodeRef<K> = NodeRef::alloc(true, false);
        let mut d = shared
            .dummy
            .latch()
            .try_exclusive()
            .expect("empty-tree group has a single owner");
        d.children.push(first);
        d.is_leaf = false;
        d.consolidate_children(shared.dummy);
        leaf = first;
    }

    let mut g = leaf
        .latch()
        .try_exclusive()
        .expect("leaf group has a single owner");

    for request in group {
        let key = request.key.clone().expect("keyed operation");
        match request.op {
            TreeOp::Insert => {
                if ops::insert_into_leaf(&mut g, key) {
                    shared.size.fetch_add(1, Ordering::Relaxed);
                }
            }
            TreeOp::Delete => {
                let removed = ops::remove_from_leaf(&mut g, &key);
                if removed {
                    shared.size.fetch_sub(1, Ordering::Relaxed);
                }
                request.reply(removed.then_some(key));
            }
            TreeOp::Get => {
                let found = g.key_position(&key).map(|pos| g.keys[pos].clone());
                request.reply(found);
            }
            TreeOp::Nop | TreeOp::Update | TreeOp::Flush => {
                unreachable!("only keyed operations reach the leaf stage")
            }
        }
    }

    if g.is_full(shared.order) || !palm_half_full(&g, shared.order) {
        let parent = leaf.parent().expect("leaf has a parent");
        shared.internal_queue.push(Request::update(parent));
    }
    g.update_min();
}

/// Processes this worker's repair slots; each holds one UPDATE naming a
/// parent whose children need re-examination.
fn internal_stage<K: Clone + Ord>(shared: &Shared<K>, id: usize) {
    for index in (id..shared.batch_size).step_by(shared.num_workers) {
        // SAFETY: slot striding gives this worker the slot during
        // EXEC_INTERNAL.
        let group = unsafe { shared.assign.get_mut(index) };
        if group.is_empty() {
            continue;
        }
        debug_assert_eq!(group.len(), 1);
        debug_assert_eq!(group[0].op, TreeOp::Update);

        let node = group[0].target.expect("update names its parent");
        trace!(
            worker = id,
            level = level_of(shared.flag.load(Ordering::Relaxed)),
            "repairing children of {node:?}"
        );
        let needs_parent = unsafe { rebalance_children(shared.order, node) };
        if needs_parent {
            let parent = unsafe { node.parent() }.expect("non-dummy node has a parent");
            shared.internal_queue.push(Request::update(parent));
        }
    }
}

/// Brings every child of `node` back within bounds, rebuilding `node` after
/// each structural change. Returns true when `node` itself ended up full or
/// underfull and its parent must be re-examined next round.
///
/// # Safety
/// This worker must own `node`'s subtree under the stage protocol.
pub(crate) unsafe fn rebalance_children<K: Clone + Ord>(order: usize, node: NodeRef<K>) -> bool {
    {
        let mut g = node
            .latch()
            .try_exclusive()
            .expect("repair target has a single owner");
        g.update_min();
    }

    'scan: loop {
        let children: Vec<NodeRef<K>> = {
            let g = node.latch().try_shared().expect("repair target has a single owner");
            g.children.iter().copied().collect()
        };

        for (position, &child) in children.iter().enumerate() {
            let (full, underfull) = {
                let cg = child
                    .latch()
                    .try_shared()
                    .expect("children are owned through their parent");
                (cg.is_full(order), !palm_half_full(&cg, order))
            };

            if full {
                let to_right = {
                    let g = node.latch().try_shared().expect("repair target owner");
                    child.child_index() < g.num_keys()
                };
                big_split(
                    order,
                    child,
                    if to_right {
                        SplitDirection::Right
                    } else {
                        SplitDirection::Left
                    },
                );
                rebuild_children(node);
                continue 'scan;
            }

            if underfull {
                if children.len() < 2 {
                    // A lone child has nothing to borrow from or merge with;
                    // the level above resolves it.
                    break 'scan;
                }
                if position == 0 {
                    let right = children[1];
                    if !try_borrow(order, child, right, false) {
                        merge(child, right, false);
                    }
                } else if position < children.len() - 1 {
                    let left = children[position - 1];
                    let right = children[position + 1];
                    if !try_borrow(order, left, child, true)
                        && !try_borrow(order, child, right, false)
                    {
                        merge(child, right, true);
                    }
                } else {
                    let left = children[position - 1];
                    if !try_borrow(order, left, child, true) {
                        merge(left, child, true);
                    }
                }
                rebuild_children(node);
                continue 'scan;
            }
        }
        break;
    }

    let g = node.latch().try_shared().expect("repair target has a single owner");
    g.is_full(order) || !palm_half_full(&g, order)
}

/// Peels a node-sized chunk off a full node into a fresh sibling.
///
/// The chunk is `order - 1` keys while the remainder stays legal, or
/// `(order - 1) / 2` keys for the final piece, so a bulk-inserted bulge
/// drains without ever producing another full sibling. The new sibling is
/// spliced into the chain; the parent discovers it at the next rebuild.
///
/// # Safety
/// Caller owns `child`'s subtree under the stage protocol.
pub(crate) unsafe fn big_split<K: Clone + Ord>(
    order: usize,
    child: NodeRef<K>,
    direction: SplitDirection,
) {
    let new_node: NodeRef<K>;
    let is_leaf;
    {
        let mut cg = child
            .latch()
            .try_exclusive()
            .expect("split target has a single owner");
        debug_assert!(cg.is_full(order));
        is_leaf = cg.is_leaf;
        new_node = NodeRef::alloc(is_leaf, false);
        let mut ng = new_node.latch().exclusive();

        let count = if cg.num_keys() - order >= (order - 1) / 2 {
            order - 1
        } else {
            (order - 1) / 2
        };

        match direction {
            SplitDirection::Right => {
                let split_at = cg.num_keys() - count;
                ng.keys.extend(cg.keys.drain(split_at..));
                if !is_leaf {
                    let child_split = cg.num_children() - (count + 1);
                    ng.children.extend(cg.children.drain(child_split..));
                    // The boundary separator dissolves; rebuilds regenerate
                    // separators from the subtree minima.
                    cg.keys.pop();
                    ng.consolidate_children(new_node);
                }
            }
            SplitDirection::Left => {
                ng.keys.extend(cg.keys.drain(..count));
                if !is_leaf {
                    ng.children.extend(cg.children.drain(..count + 1));
                    cg.keys.remove(0);
                    ng.consolidate_children(new_node);
                }
            }
        }

        new_node.set_parent(child.parent());
        debug_assert!(palm_half_full(&cg, order));
        debug_assert!(palm_half_full(&ng, order));
    }

    match direction {
        SplitDirection::Right => child.link_after(new_node),
        SplitDirection::Left => child.link_before(new_node),
    }

    if is_leaf {
        child
            .latch()
            .try_exclusive()
            .expect("split target owner")
            .update_min();
        new_node
            .latch()
            .try_exclusive()
            .expect("fresh node is unshared")
            .update_min();
    } else {
        rebuild_children(child);
        rebuild_children(new_node);
    }
}

/// Moves keys from the richer sibling into the poorer one until the poorer
/// side is legal or the richer side has nothing spare. `left` and `right`
/// are adjacent children of the same parent; `from_left` names the donor.
///
/// Returns true when the receiving side ended up at least half full.
///
/// # Safety
/// Caller owns the parent's subtree under the stage protocol.
unsafe fn try_borrow<K: Clone + Ord>(
    order: usize,
    left: NodeRef<K>,
    right: NodeRef<K>,
    from_left: bool,
) -> bool {
    let parent = left.parent().expect("borrow operates below the root");
    let index = left.child_index();

    let mut pg = parent
        .latch()
        .try_exclusive()
        .expect("repair target has a single owner");
    let mut lg = left.latch().try_exclusive().expect("child owner");
    let mut rg = right.latch().try_exclusive().expect("child owner");
    debug_assert_eq!(lg.is_leaf, rg.is_leaf);

    if from_left {
        while palm_more_half_full(&lg, order) && !palm_half_full(&rg, order) {
            if rg.is_leaf {
                // Leaf keys move directly; the separator tracks the new
                // minimum of the right side.
                let moved = lg.keys.pop().expect("donor has a key");
                pg.keys[index] = moved.clone();
                rg.keys.insert(0, moved);
            } else {
                let from_sibling = lg.keys.pop().expect("donor has a key");
                let from_parent = std::mem::replace(&mut pg.keys[index], from_sibling);
                rg.keys.insert(0, from_parent);
                rg.children.insert(0, lg.children.pop().expect("internal donor has a child"));
                rg.consolidate_children(right);
            }
            rg.update_min();
        }
        palm_half_full(&rg, order)
    } else {
        while palm_more_half_full(&rg, order) && !palm_half_full(&lg, order) {
            if lg.is_leaf {
                let moved = rg.keys.remove(0);
                lg.keys.push(moved);
                pg.keys[index] = rg.keys[0].clone();
            } else {
                let from_sibling = rg.keys.remove(0);
                let from_parent = std::mem::replace(&mut pg.keys[index], from_sibling);
                lg.keys.push(from_parent);
                lg.children.push(rg.children.remove(0));
                lg.consolidate_children(left);
                rg.consolidate_children(right);
            }
            rg.update_min();
        }
        palm_half_full(&lg, order)
    }
}

/// Coalesces two adjacent same-parent siblings. `left_into_right` selects
/// the survivor so the parent's first and last children keep their
/// identities. The parent's separator and child entry are removed here; the
/// following rebuild regenerates the remaining keys.
///
/// # Safety
/// Caller owns the parent's subtree under the stage protocol.
unsafe fn merge<K: Clone + Ord>(left: NodeRef<K>, right: NodeRef<K>, left_into_right: bool) {
    let parent = left.parent().expect("merge operates below the root");
    let index = left.child_index();

    {
        let mut pg = parent
            .latch()
            .try_exclusive()
            .expect("repair target has a single owner");
        let mut lg = left.latch().try_exclusive().expect("child owner");
        let mut rg = right.latch().try_exclusive().expect("child owner");
        debug_assert_eq!(lg.is_leaf, rg.is_leaf);

        if left_into_right {
            if !lg.is_leaf {
                rg.keys.insert(0, pg.keys[index].clone());
                for (offset, grandchild) in lg.children.drain(..).enumerate() {
                    rg.children.insert(offset, grandchild);
                }
            }
            pg.keys.remove(index);
            pg.children.remove(index);
            for (offset, key) in lg.keys.drain(..).enumerate() {
                rg.keys.insert(offset, key);
            }
            rg.consolidate_children(right);
            left.unlink();
            rg.update_min();
        } else {
            if !rg.is_leaf {
                lg.keys.push(pg.keys[index].clone());
                lg.children.extend(rg.children.drain(..));
            }
            pg.keys.remove(index);
            pg.children.remove(index + 1);
            lg.keys.extend(rg.keys.drain(..));
            lg.consolidate_children(left);
            right.unlink();
            lg.update_min();
        }
    }

    if left_into_right {
        left.free();
    } else {
        right.free();
    }
}

/// Rebuilds `node`'s keys and children by walking the sibling chain between
/// its first and last children. Those endpoints survive splits and merges
/// between them, so the walk sees exactly the current child set, including
/// freshly split-off siblings the child vector does not know about yet.
///
/// # Safety
/// Caller owns `node`'s subtree under the stage protocol.
pub(crate) unsafe fn rebuild_children<K: Clone + Ord>(node: NodeRef<K>) {
    let mut g = node
        .latch()
        .try_exclusive()
        .expect("repair target has a single owner");
    debug_assert!(!g.is_leaf);

    let first = *g.children.first().expect("internal node has children");
    let last = *g.children.last().expect("internal node has children");
    g.keys.clear();
    g.children.clear();

    let mut index = 0usize;
    let mut walker = Some(first);
    loop {
        let piece = walker.expect("sibling chain reaches the stable right endpoint");
        piece.set_parent(Some(node));
        piece.set_child_index(index);
        let min = {
            let mut pg = piece
                .latch()
                .try_exclusive()
                .expect("children are owned through their parent");
            pg.update_min();
            pg.min_elem.clone()
        };
        if index > 0 {
            g.keys.push(min.expect("non-leftmost child has a cached min"));
        }
        g.children.push(piece);
        if piece == last {
            break;
        }
        index += 1;
        walker = piece.next();
    }

    g.update_min();
}
