//! Batched B+ tree in the style of the PALM design.
//!
//! Clients never touch the node graph. Operations are enqueued onto an MPSC
//! intake channel and return immediately; a background coordinator drains
//! them into fixed-size batches and drives a worker pool through three
//! synchronized stages per batch:
//!
//! 1. **SEARCH** - each worker resolves its share of the batch to target
//!    leaves with a read-only descent.
//! 2. **EXEC_LEAF** - requests are grouped by leaf so no two workers share a
//!    node, then applied in batch order.
//! 3. **EXEC_INTERNAL** - structural repairs propagate level by level:
//!    parents whose children overflowed or underflowed are regrouped and
//!    fixed, repeating until the queue of repairs drains, after which the
//!    coordinator itself splits or collapses the root as needed.
//!
//! Within one batch, operations on the same leaf observe each other in
//! submission order; across batches the intake order is preserved. A client
//! needing a result blocks on the per-request completion handle.

mod scheduler;
mod worker;

use self::scheduler::Shared;
use crate::error::{Error, Result};
use crate::node::NodeRef;
use crate::TreeIndex;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

/// Requests processed per batch unless overridden at construction.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Operation carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeOp {
    /// Padding for unused batch slots.
    Nop,
    Insert,
    Delete,
    Get,
    /// Internal: re-examine the children of `target` at the next level up.
    Update,
    /// Completes once every previously submitted request has been applied.
    Flush,
}

/// A unit of work flowing through the scheduler.
pub(crate) struct Request<K> {
    pub(crate) op: TreeOp,
    pub(crate) key: Option<K>,
    /// Slot position within the current batch.
    pub(crate) idx: usize,
    /// Resolved leaf (after SEARCH) or the parent named by an UPDATE.
    pub(crate) target: Option<NodeRef<K>>,
    /// Completion signal; present on GET, on DELETE when the caller wants
    /// the outcome, and on FLUSH.
    pub(crate) done: Option<Sender<Option<K>>>,
}

impl<K: Clone> Clone for Request<K> {
    fn clone(&self) -> Self {
        Request {
            op: self.op,
            key: self.key.clone(),
            idx: self.idx,
            target: self.target,
            done: self.done.clone(),
        }
    }
}

impl<K> Request<K> {
    pub(crate) fn nop() -> Request<K> {
        Request {
            op: TreeOp::Nop,
            key: None,
            idx: 0,
            target: None,
            done: None,
        }
    }

    pub(crate) fn insert(key: K) -> Request<K> {
        Request {
            op: TreeOp::Insert,
            key: Some(key),
            idx: 0,
            target: None,
            done: None,
        }
    }

    pub(crate) fn delete(key: K, done: Option<Sender<Option<K>>>) -> Request<K> {
        Request {
            op: TreeOp::Delete,
            key: Some(key),
            idx: 0,
            target: None,
            done,
        }
    }

    pub(crate) fn get(key: K, done: Sender<Option<K>>) -> Request<K> {
        Request {
            op: TreeOp::Get,
            key: Some(key),
            idx: 0,
            target: None,
            done: Some(done),
        }
    }

    pub(crate) fn update(target: NodeRef<K>) -> Request<K> {
        Request {
            op: TreeOp::Update,
            key: None,
            idx: 0,
            target: Some(target),
            done: None,
        }
    }

    pub(crate) fn flush(done: Sender<Option<K>>) -> Request<K> {
        Request {
            op: TreeOp::Flush,
            key: None,
            idx: 0,
            target: None,
            done: Some(done),
        }
    }

    /// Sends the reply if anyone is waiting for it.
    pub(crate) fn reply(&self, value: Option<K>) {
        if let Some(done) = &self.done {
            // A dropped handle just means the caller stopped caring.
            let _ = done.send(value);
        }
    }
}

/// Completion handle for an in-flight request.
pub struct Lookup<K> {
    rx: Receiver<Option<K>>,
}

impl<K> Lookup<K> {
    /// Blocks until the batch containing the request commits.
    ///
    /// # Panics
    /// Panics if the scheduler terminated with the request in flight, which
    /// indicates a defect in the shutdown protocol.
    pub fn wait(self) -> Option<K> {
        self.try_wait().expect("palm scheduler terminated with a request in flight")
    }

    /// Non-panicking variant of [`Lookup::wait`].
    pub fn try_wait(self) -> Result<Option<K>> {
        self.rx.recv().map_err(|_| Error::Disconnected)
    }
}

/// Concurrent B+ tree processing operations in coordinated batches.
pub struct PalmTree<K> {
    shared: Arc<Shared<K>>,
    intake: Option<Sender<Request<K>>>,
    coordinator: Option<thread::JoinHandle<()>>,
}

impl<K: Clone + Ord + Send + Sync + 'static> PalmTree<K> {
    /// Creates a tree with the default batch size.
    ///
    /// # Panics
    /// Panics if `order < 3` or `num_workers == 0`.
    pub fn new(order: usize, num_workers: usize) -> PalmTree<K> {
        PalmTree::with_batch_size(order, num_workers, DEFAULT_BATCH_SIZE)
    }

    /// Creates a tree with an explicit batch size.
    pub fn with_batch_size(order: usize, num_workers: usize, batch_size: usize) -> PalmTree<K> {
        assert!(order >= 3, "order must be at least 3");
        assert!(num_workers >= 1, "need at least one worker");
        assert!(batch_size >= 1, "batch size must be positive");

        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared::new(order, num_workers, batch_size));
        let coordinator = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("palm-coordinator".into())
                .spawn(move || scheduler::coordinator_loop(shared, rx))
                .expect("failed to spawn palm coordinator")
        };

        PalmTree {
            shared,
            intake: Some(tx),
            coordinator: Some(coordinator),
        }
    }

    /// Enqueues an insert and returns immediately.
    pub fn insert(&self, key: K) {
        self.submit(Request::insert(key))
            .expect("palm scheduler is running");
    }

    /// Enqueues a delete and returns immediately.
    pub fn remove(&self, key: K) {
        self.submit(Request::delete(key, None))
            .expect("palm scheduler is running");
    }

    /// Enqueues a delete and blocks until it is applied, reporting whether
    /// the key was present.
    pub fn remove_wait(&self, key: K) -> bool {
        let (tx, rx) = bounded(1);
        self.submit(Request::delete(key, Some(tx)))
            .expect("palm scheduler is running");
        Lookup { rx }.wait().is_some()
    }

    /// Enqueues a lookup; the returned handle resolves when the batch
    /// containing it commits.
    pub fn get(&self, key: K) -> Lookup<K> {
        let (tx, rx) = bounded(1);
        self.submit(Request::get(key, tx))
            .expect("palm scheduler is running");
        Lookup { rx }
    }

    /// Blocks until every previously submitted request has been applied.
    pub fn flush(&self) {
        let (tx, rx) = bounded(1);
        self.submit(Request::flush(tx))
            .expect("palm scheduler is running");
        let _ = Lookup { rx }.wait();
    }

    /// Number of keys currently stored. Reflects only requests whose batch
    /// has committed; call [`PalmTree::flush`] first for an exact answer.
    pub fn len(&self) -> usize {
        self.shared.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn submit(&self, request: Request<K>) -> Result<()> {
        match &self.intake {
            Some(tx) => tx.send(request).map_err(|_| Error::Shutdown),
            None => Err(Error::Shutdown),
        }
    }
}

impl<K: Clone + Ord + Send + Sync + 'static> PalmTree<K> {
    /// All keys in ascending order. Quiesces the scheduler first.
    pub fn to_vec(&mut self) -> Vec<K> {
        self.flush();
        unsafe {
            let mut out = Vec::with_capacity(self.len());
            let mut cur = self.shared.dummy;
            loop {
                let g = cur.latch().shared();
                if g.is_leaf {
                    break;
                }
                cur = g.children[0];
            }
            if cur == self.shared.dummy {
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
}

impl<K: Clone + Ord + Send + Sync + 'static + fmt::Debug> PalmTree<K> {
    /// Validates every structural invariant, including the cached subtree
    /// minima. Quiesces the scheduler first.
    pub fn check_invariants(&mut self) {
        self.flush();
        unsafe {
            crate::debug::validate(
                self.shared.dummy,
                self.shared.order,
                (self.shared.order - 1) / 2,
                true,
                self.len(),
            );
        }
    }

    /// Renders the tree level by level, serialized by the global print lock.
    pub fn debug_print(&mut self) {
        self.flush();
        let _guard = crate::debug::print_lock().lock();
        eprintln!("{}", unsafe { crate::debug::render(self.shared.dummy) });
    }
}

impl<K> Drop for PalmTree<K> {
    fn drop(&mut self) {
        // Closing the intake lets the coordinator drain every pending
        // request before it raises the terminate flag; nothing is lost.
        drop(self.intake.take());
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }
        // SAFETY: coordinator and workers have exited; the dummy owns the
        // whole graph.
        unsafe {
            self.shared.dummy.release_subtree();
        }
    }
}

impl<K: Clone + Ord + Send + Sync + 'static> TreeIndex<K> for PalmTree<K> {
    fn insert(&self, key: K) {
        PalmTree::insert(self, key);
    }

    fn remove(&self, key: &K) -> bool {
        self.remove_wait(key.clone())
    }

    fn get(&self, key: &K) -> Option<K> {
        PalmTree::get(self, key.clone()).wait()
    }

    fn size(&self) -> usize {
        self.flush();
        self.len()
    }
}
