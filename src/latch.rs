//! Per-node latch primitive.
//!
//! Every tree node is stored behind a [`Latch`], a thin pairing of a
//! `parking_lot::RwLock` (used purely for mutual exclusion, it protects a unit
//! value) with an `UnsafeCell` holding the node payload. Access goes through
//! RAII guards:
//!
//! | Mode      | Blocking? | Used by                                   |
//! |-----------|-----------|-------------------------------------------|
//! | Shared    | Yes       | read descent (lock coupling)              |
//! | Exclusive | Yes       | write descent, rebalancing                |
//! | Try-*     | No        | batched stages asserting sole ownership   |
//!
//! The try variants exist for the batched engine: within an execution stage no
//! two workers may touch the same node, so a worker claims its nodes with
//! `try_exclusive` and treats failure as a scheduling defect rather than a
//! reason to wait.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::cell::UnsafeCell;
use std::time::Duration;

/// A spin-wait with staged backoff, used by rendezvous loops.
///
/// The first iterations stay on the CPU (`spin_loop`), the next batch yields
/// to the scheduler, and once the budget is exhausted each further iteration
/// parks the thread briefly so an idle pool does not burn a core.
pub(crate) struct SpinWait {
    counter: u32,
}

impl SpinWait {
    pub(crate) fn new() -> Self {
        SpinWait { counter: 0 }
    }

    /// Performs one wait iteration, escalating from spinning to yielding to
    /// sleeping.
    pub(crate) fn spin(&mut self) {
        if self.counter < 10 {
            self.counter += 1;
            std::hint::spin_loop();
        } else if self.counter < 30 {
            self.counter += 1;
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    pub(crate) fn reset(&mut self) {
        self.counter = 0;
    }
}

/// A shared/exclusive latch wrapping its protected data.
///
/// Unlike `RwLock<T>`, the payload lives in an `UnsafeCell` next to the lock
/// rather than inside it. This keeps raw access possible for the single-owner
/// cases (tree construction and destruction) without taking the lock.
pub struct Latch<T> {
    lock: RwLock<()>,
    data: UnsafeCell<T>,
}

// SAFETY: a Latch hands out references to its payload only under the RwLock
// protocol (or to callers holding `&mut self`), so it is as thread-safe as an
// RwLock<T> would be.
unsafe impl<T: Send> Send for Latch<T> {}
unsafe impl<T: Send + Sync> Sync for Latch<T> {}

impl<T> Latch<T> {
    #[inline]
    pub fn new(data: T) -> Latch<T> {
        Latch {
            lock: RwLock::new(()),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires shared (read) access, blocking while a writer holds the latch.
    #[inline]
    pub fn shared(&self) -> SharedGuard<'_, T> {
        let guard = self.lock.read();
        SharedGuard {
            guard,
            data: self.data.get(),
        }
    }

    /// Acquires exclusive (write) access, blocking until available.
    #[inline]
    pub fn exclusive(&self) -> ExclusiveGuard<'_, T> {
        let guard = self.lock.write();
        ExclusiveGuard {
            guard,
            data: self.data.get(),
        }
    }

    /// Attempts to acquire shared access without blocking.
    #[inline]
    pub fn try_shared(&self) -> Option<SharedGuard<'_, T>> {
        self.lock.try_read().map(|guard| SharedGuard {
            guard,
            data: self.data.get(),
        })
    }

    /// Attempts to acquire exclusive access without blocking.
    ///
    /// The batched engine uses this to claim nodes it already owns by stage
    /// discipline; a `None` there means the disjointness invariant is broken.
    #[inline]
    pub fn try_exclusive(&self) -> Option<ExclusiveGuard<'_, T>> {
        self.lock.try_write().map(|guard| ExclusiveGuard {
            guard,
            data: self.data.get(),
        })
    }
}

impl<T> std::convert::AsMut<T> for Latch<T> {
    /// Direct access to the payload through `&mut self`, bypassing the lock.
    #[inline]
    fn as_mut(&mut self) -> &mut T {
        // SAFETY: `&mut self` guarantees no guard is alive.
        unsafe { &mut *self.data.get() }
    }
}

/// RAII guard for shared access. Multiple may coexist; writers are blocked.
pub struct SharedGuard<'a, T> {
    #[allow(dead_code)]
    guard: RwLockReadGuard<'a, ()>,
    data: *const T,
}

unsafe impl<'a, T: Sync> Sync for SharedGuard<'a, T> {}

impl<'a, T> std::ops::Deref for SharedGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the read lock is held, no writer can be active.
        unsafe { &*self.data }
    }
}

/// RAII guard for exclusive access.
pub struct ExclusiveGuard<'a, T> {
    #[allow(dead_code)]
    guard: RwLockWriteGuard<'a, ()>,
    data: *mut T,
}

unsafe impl<'a, T: Sync> Sync for ExclusiveGuard<'a, T> {}

impl<'a, T> std::ops::Deref for ExclusiveGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the write lock is held.
        unsafe { &*self.data }
    }
}

impl<'a, T> std::ops::DerefMut for ExclusiveGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the write lock is held, this is the only access path.
        unsafe { &mut *self.data }
    }
}

impl<'a, T> std::convert::AsMut<T> for ExclusiveGuard<'a, T> {
    #[inline]
    fn as_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_read_access() {
        let latch = Latch::new(42);
        let a = latch.shared();
        let b = latch.shared();
        assert_eq!(*a, 42);
        assert_eq!(*b, 42);
    }

    #[test]
    fn exclusive_write_access() {
        let latch = Latch::new(vec![1, 2, 3]);
        {
            let mut g = latch.exclusive();
            g.push(4);
        }
        assert_eq!(*latch.shared(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn try_exclusive_fails_under_shared() {
        let latch = Latch::new(0u32);
        let _s = latch.shared();
        assert!(latch.try_exclusive().is_none());
    }

    #[test]
    fn try_exclusive_succeeds_when_free() {
        let latch = Latch::new(0u32);
        {
            let mut g = latch.try_exclusive().expect("uncontended");
            *g = 7;
        }
        assert_eq!(*latch.shared(), 7);
    }

    #[test]
    fn try_shared_fails_under_exclusive() {
        let latch = Latch::new(0u32);
        let _x = latch.exclusive();
        assert!(latch.try_shared().is_none());
    }

    #[test]
    fn as_mut_bypasses_lock() {
        let mut latch = Latch::new(1);
        *latch.as_mut() = 2;
        assert_eq!(*latch.shared(), 2);
    }

    #[test]
    fn spinwait_escalates_without_panicking() {
        let mut sw = SpinWait::new();
        for _ in 0..40 {
            sw.spin();
        }
        sw.reset();
        sw.spin();
    }
}
