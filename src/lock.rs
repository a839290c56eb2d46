//! The recursive stack lock. The engine's poll loop and every
//! connection adapter that needs to touch the smoltcp `Interface`/`SocketSet`
//! acquire this lock; callbacks into user-supplied handlers always run after
//! it is released (see the concurrency rule in the crate's top-level docs).
//!
//! `parking_lot::ReentrantMutex` models this exactly rather than
//! approximately: the tokio runtime that owns the stack is built with a
//! single worker thread, so "the thread already holding the lock" and "the
//! task currently driving the stack" are the same notion, and recursive
//! re-entry from nested poll/callback code on that one thread is safe and
//! non-deadlocking by construction.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;

/// Recursive mutex guarding the stack engine's mutable state.
pub struct StackLock<T> {
    inner: ReentrantMutex<RefCell<T>>,
}

impl<T> StackLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(value)),
        }
    }

    /// Acquires the lock and runs `f` against the guarded value. Safe to call
    /// re-entrantly from the same thread, e.g. a connection adapter calling
    /// back into the engine from inside a handler invoked by the engine.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let guard = self.inner.lock();
        let mut value = guard.borrow_mut();
        f(&mut value)
    }

    pub fn lock(&self) -> StackLockGuard<'_, T> {
        StackLockGuard {
            guard: self.inner.lock(),
        }
    }
}

pub struct StackLockGuard<'a, T> {
    guard: ReentrantMutexGuard<'a, RefCell<T>>,
}

impl<'a, T> StackLockGuard<'a, T> {
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut value = self.guard.borrow_mut();
        f(&mut value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_access_from_same_thread_does_not_deadlock() {
        let lock = StackLock::new(0u32);
        lock.with(|outer| {
            *outer += 1;
            lock.with(|inner| {
                *inner += 1;
            });
        });
        lock.with(|v| assert_eq!(*v, 2));
    }
}
