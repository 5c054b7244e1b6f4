//! Coordinator side of the batched engine.
//!
//! The scheduler owns the batch buffer, the per-slot assignment lists, the
//! queue of pending structural repairs and the rendezvous flags. Stages are
//! driven lockstep:
//!
//! ```text
//! coordinator                       workers
//! -----------                       -------
//! write stage state
//! barrier := 0
//! raise every worker gate
//! bg_move := false         ----->   gate open, bg_move clear: run stage
//!                                   clear own gate
//!                                   barrier += 1
//! wait barrier == workers  <-----
//! bg_move := true
//! (exclusive access to all shared state and the tree)
//! ```
//!
//! Between stages the coordinator is the only running party, so it may touch
//! the batch buffer, the assignment slots and the tree without latching.
//! All cross-thread publication rides the Release/Acquire pairs on the gate,
//! barrier and `bg_move` flags.

use super::worker;
use super::{Request, TreeOp};
use crate::latch::SpinWait;
use crate::node::NodeRef;
use crossbeam_channel::{Receiver, TryRecvError};
use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};

/// Execution stage, stored packed with the level in [`Shared::flag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PalmStage {
    Search = 0,
    ExecLeaf = 1,
    ExecInternal = 2,
}

pub(crate) fn pack_flag(stage: PalmStage, level: usize) -> usize {
    (level << 2) | stage as usize
}

pub(crate) fn stage_of(flag: usize) -> PalmStage {
    match flag & 0b11 {
        0 => PalmStage::Search,
        1 => PalmStage::ExecLeaf,
        2 => PalmStage::ExecInternal,
        _ => unreachable!("invalid stage bits"),
    }
}

pub(crate) fn level_of(flag: usize) -> usize {
    flag >> 2
}

/// Fixed array of slots accessed without locking under the stage protocol.
///
/// During SEARCH, worker `t` owns slots `i` with `i % num_workers == t`;
/// between stages the coordinator owns everything. The Release/Acquire
/// rendezvous flags order those accesses.
pub(crate) struct SlotArray<T>(Box<[UnsafeCell<T>]>);

// SAFETY: disjoint slot ownership per the stage protocol stands in for a
// per-slot lock.
unsafe impl<T: Send> Sync for SlotArray<T> {}

impl<T> SlotArray<T> {
    fn new_with(len: usize, mut init: impl FnMut() -> T) -> SlotArray<T> {
        SlotArray((0..len).map(|_| UnsafeCell::new(init())).collect())
    }

    /// # Safety
    /// Caller must own slot `index` under the stage protocol.
    #[inline]
    pub(crate) unsafe fn get(&self, index: usize) -> &T {
        &*self.0[index].get()
    }

    /// # Safety
    /// Caller must own slot `index` under the stage protocol.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn get_mut(&self, index: usize) -> &mut T {
        &mut *self.0[index].get()
    }
}

/// State shared between the tree handle, the coordinator and the workers.
pub(crate) struct Shared<K> {
    pub(crate) order: usize,
    pub(crate) num_workers: usize,
    pub(crate) batch_size: usize,
    pub(crate) dummy: NodeRef<K>,
    /// The current batch, NOP-padded to `batch_size`.
    pub(crate) batch: SlotArray<Request<K>>,
    /// Per-slot request groups for the execution stages.
    pub(crate) assign: SlotArray<Vec<Request<K>>>,
    /// Structural repairs discovered by the execution stages.
    pub(crate) internal_queue: SegQueue<Request<K>>,
    /// Packed stage and level.
    pub(crate) flag: AtomicUsize,
    /// True while the coordinator owns the shared state.
    pub(crate) bg_move: AtomicBool,
    /// Per-worker go signals.
    pub(crate) worker_gate: Box<[CachePadded<AtomicBool>]>,
    /// Count of workers done with the current stage.
    pub(crate) barrier: AtomicUsize,
    pub(crate) terminate: AtomicBool,
    /// Committed key count.
    pub(crate) size: AtomicUsize,
}

// SAFETY: the slot arrays and node graph are governed by the stage protocol;
// everything else is atomics.
unsafe impl<K: Send + Sync> Send for Shared<K> {}
unsafe impl<K: Send + Sync> Sync for Shared<K> {}

impl<K: Clone + Ord> Shared<K> {
    pub(crate) fn new(order: usize, num_workers: usize, batch_size: usize) -> Shared<K> {
        Shared {
            order,
            num_workers,
            batch_size,
            dummy: NodeRef::alloc(true, true),
            batch: SlotArray::new_with(batch_size, Request::nop),
            assign: SlotArray::new_with(batch_size, Vec::new),
            internal_queue: SegQueue::new(),
            flag: AtomicUsize::new(pack_flag(PalmStage::Search, 0)),
            bg_move: AtomicBool::new(true),
            worker_gate: (0..num_workers)
                .map(|_| CachePadded::new(AtomicBool::new(false)))
                .collect(),
            barrier: AtomicUsize::new(0),
            terminate: AtomicBool::new(false),
            size: AtomicUsize::new(0),
        }
    }
}

/// Body of the coordinator thread. Spawns the worker pool, processes batches
/// until the intake disconnects and every pending request has been drained,
/// then terminates the pool.
pub(crate) fn coordinator_loop<K: Clone + Ord + Send + Sync + 'static>(
    shared: Arc<Shared<K>>,
    intake: Receiver<Request<K>>,
) {
    let workers: Vec<thread::JoinHandle<()>> = (0..shared.num_workers)
        .map(|id| {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("palm-worker-{id}"))
                .spawn(move || worker::worker_loop(shared, id))
                .expect("failed to spawn palm worker")
        })
        .collect();

    let mut flushes: Vec<Request<K>> = Vec::new();
    loop {
        let (filled, disconnected) = fill_batch(&shared, &intake, &mut flushes);

        if filled > 0 {
            debug!(requests = filled, "executing batch");
            run_stage(&shared, PalmStage::Search, 0);
            group_by_leaf(&shared);
            run_stage(&shared, PalmStage::ExecLeaf, 0);

            let mut level = 1;
            loop {
                let repairs = stage_repairs(&shared);
                if repairs == 0 {
                    break;
                }
                trace!(level, repairs, "internal repair round");
                run_stage(&shared, PalmStage::ExecInternal, level);
                level += 1;
            }

            // SAFETY: all workers are parked behind bg_move.
            unsafe { rebalance_root(&shared) };
        }

        for flush in flushes.drain(..) {
            flush.reply(None);
        }

        if disconnected {
            break;
        }
    }

    debug!("intake drained, terminating workers");
    shared.terminate.store(true, Ordering::Release);
    for handle in workers {
        let _ = handle.join();
    }
}

/// Fills the batch buffer, blocking for the first request. Flush requests
/// are set aside to be answered once the batch commits. Returns the number
/// of slots filled and whether the intake has disconnected and drained.
fn fill_batch<K: Clone + Ord>(
    shared: &Shared<K>,
    intake: &Receiver<Request<K>>,
    flushes: &mut Vec<Request<K>>,
) -> (usize, bool) {
    let mut filled = 0usize;
    let mut disconnected = false;

    let mut place = |request: Request<K>, filled: &mut usize| {
        if request.op == TreeOp::Flush {
            flushes.push(request);
            return;
        }
        // SAFETY: workers are parked between batches; the coordinator owns
        // every slot.
        let slot = unsafe { shared.batch.get_mut(*filled) };
        *slot = request;
        slot.idx = *filled;
        *filled += 1;
    };

    match intake.recv() {
        Ok(request) => place(request, &mut filled),
        Err(_) => disconnected = true,
    }
    while !disconnected && filled < shared.batch_size {
        match intake.try_recv() {
            Ok(request) => place(request, &mut filled),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => disconnected = true,
        }
    }

    for index in filled..shared.batch_size {
        // SAFETY: same exclusive window as above.
        unsafe { *shared.batch.get_mut(index) = Request::nop() };
    }

    (filled, disconnected)
}

/// Runs one stage to completion: publishes the stage, releases the workers
/// and waits for the last of them to arrive at the barrier.
fn run_stage<K>(shared: &Shared<K>, stage: PalmStage, level: usize) {
    shared.flag.store(pack_flag(stage, level), Ordering::Release);
    shared.barrier.store(0, Ordering::Release);
    for gate in shared.worker_gate.iter() {
        gate.store(true, Ordering::Release);
    }
    shared.bg_move.store(false, Ordering::Release);

    let mut spin = SpinWait::new();
    while shared.barrier.load(Ordering::Acquire) != shared.num_workers {
        spin.spin();
    }
    shared.bg_move.store(true, Ordering::Release);
}

/// Groups the searched batch by target leaf. Every group lands in the slot
/// of its first request, so request order within a leaf is batch order and
/// the slot choice is stable.
fn group_by_leaf<K: Clone + Ord>(shared: &Shared<K>) {
    let mut slot_of: HashMap<usize, usize> = HashMap::new();
    // SAFETY: coordinator-exclusive window between stages.
    unsafe {
        for index in 0..shared.batch_size {
            shared.assign.get_mut(index).clear();
        }
        for index in 0..shared.batch_size {
            let request = shared.batch.get(index);
            if request.op == TreeOp::Nop {
                continue;
            }
            let leaf = request.target.expect("search stage resolved a leaf");
            // Canonical slot for a shared leaf: the batch index of its first
            // request.
            let slot = *slot_of.entry(leaf.addr()).or_insert(request.idx);
            shared.assign.get_mut(slot).push(request.clone());
        }
    }
}

/// Drains the repair queue into the assignment slots, one slot per distinct
/// parent. Repairs aimed at the dummy mean the real root needs attention;
/// the coordinator handles that itself after the rounds finish.
fn stage_repairs<K: Clone + Ord>(shared: &Shared<K>) -> usize {
    let mut seen: HashSet<usize> = HashSet::new();
    let mut repairs: Vec<Request<K>> = Vec::new();
    while let Some(request) = shared.internal_queue.pop() {
        let target = request.target.expect("update names its parent");
        if target == shared.dummy {
            continue;
        }
        if seen.insert(target.addr()) {
            repairs.push(request);
        }
    }

    debug_assert!(repairs.len() <= shared.batch_size);
    // SAFETY: coordinator-exclusive window between stages.
    unsafe {
        for index in 0..shared.batch_size {
            shared.assign.get_mut(index).clear();
        }
        for (slot, request) in repairs.iter().enumerate() {
            shared.assign.get_mut(slot).push(request.clone());
        }
    }
    repairs.len()
}

/// Splits or collapses the real root until it is a legal root again.
///
/// # Safety
/// Must run in a coordinator-exclusive window.
unsafe fn rebalance_root<K: Clone + Ord>(shared: &Shared<K>) {
    enum Fix {
        Grow,
        Promote,
        Clear,
    }

    let order = shared.order;
    let dummy = shared.dummy;
    loop {
        let root = {
            let d = dummy
                .latch()
                .try_exclusive()
                .expect("coordinator owns the tree between stages");
            match d.children.first() {
                Some(&root) => root,
                None => return,
            }
        };

        let fix = {
            let g = root
                .latch()
                .try_shared()
                .expect("coordinator owns the tree between stages");
            if g.is_full(order) {
                Some(Fix::Grow)
            } else if g.num_keys() == 0 {
                if g.is_leaf {
                    Some(Fix::Clear)
                } else {
                    Some(Fix::Promote)
                }
            } else {
                None
            }
        };

        match fix {
            None => return,
            Some(Fix::Clear) => {
                // The last key is gone; fold back to the empty state.
                let mut d = dummy.latch().try_exclusive().expect("coordinator owns the tree");
                d.children.clear();
                d.is_leaf = true;
                drop(d);
                root.free();
                return;
            }
            Some(Fix::Promote) => {
                let child = {
                    let g = root.latch().try_shared().expect("coordinator owns the tree");
                    debug_assert_eq!(g.num_children(), 1);
                    g.children[0]
                };
                {
                    let mut d = dummy.latch().try_exclusive().expect("coordinator owns the tree");
                    d.children[0] = child;
                }
                child.set_parent(Some(dummy));
                child.set_child_index(0);
                {
                    let mut g = root.latch().try_exclusive().expect("coordinator owns the tree");
                    g.children.clear();
                }
                root.free();
                // The promoted child may itself be an exhausted root.
            }
            Some(Fix::Grow) => {
                trace!("root overflow, growing tree");
                let new_root: NodeRef<K> = NodeRef::alloc(false, false);
                root.set_parent(Some(new_root));
                root.set_child_index(0);

                // Peel the bulge into right-hand siblings until the old root
                // is legal; the pieces stay chained in key order.
                loop {
                    let still_full = root
                        .latch()
                        .try_shared()
                        .expect("coordinator owns the tree")
                        .is_full(order);
                    if !still_full {
                        break;
                    }
                    worker::big_split(order, root, worker::SplitDirection::Right);
                }

                // Collect the pieces into the new root.
                {
                    let mut g = new_root.latch().exclusive();
                    let mut index = 0usize;
                    let mut walker = Some(root);
                    while let Some(piece) = walker {
                        piece.set_parent(Some(new_root));
                        piece.set_child_index(index);
                        let min = {
                            let mut pg = piece
                                .latch()
                                .try_exclusive()
                                .expect("coordinator owns the tree");
                            pg.update_min();
                            pg.min_elem.clone()
                        };
                        if index > 0 {
                            g.keys.push(min.expect("split piece has a cached min"));
                        }
                        g.children.push(piece);
                        index += 1;
                        walker = piece.next();
                    }
                    g.update_min();
                }

                {
                    let mut d = dummy.latch().try_exclusive().expect("coordinator owns the tree");
                    d.children[0] = new_root;
                }
                new_root.set_parent(Some(dummy));
                new_root.set_child_index(0);
                // The new root may itself have overflowed; loop to re-check.
            }
        }
    }
}
