//! Per-caller lookup bookkeeping.
//!
//! One [`LookupContext`] lives for the duration of one logical operation
//! (one top-level lookup or update, including every nested reference it
//! hydrates). It is passed explicitly down the call chain rather than kept
//! in thread-local storage, which keeps graph hydration composable and the
//! reentrancy visible in signatures.
//!
//! The latch protocol orders "my graph is fully built" after every creation
//! this traversal depended on: a caller's own latch is released on unwind,
//! then the caller blocks on the latch of every in-flight creation it leaned
//! on, so a half-built graph is never observable as complete.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Binary latch: starts released, is reset for the duration of one
/// operation, and released again on unwind.
pub(crate) struct OperationLatch {
    released: Mutex<bool>,
    cond: Condvar,
}

const LATCH_POLL: Duration = Duration::from_millis(1_000);

impl OperationLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(OperationLatch {
            released: Mutex::new(true),
            cond: Condvar::new(),
        })
    }

    pub fn reset(&self) {
        *self.released.lock().expect("latch lock poisoned") = false;
    }

    pub fn release(&self) {
        *self.released.lock().expect("latch lock poisoned") = true;
        self.cond.notify_all();
    }

    /// Block until released. Bounded re-check wait, no deadline.
    pub fn acquire(&self) {
        let mut released = self.released.lock().expect("latch lock poisoned");
        while !*released {
            let (guard, _) = self
                .cond
                .wait_timeout(released, LATCH_POLL)
                .expect("latch lock poisoned");
            released = guard;
        }
    }
}

/// Explicit per-operation state: a reentrancy depth, this operation's own
/// latch, and the latches of other in-flight creations it depends on.
pub(crate) struct LookupContext {
    depth: usize,
    latch: Arc<OperationLatch>,
    wait_set: Vec<Arc<OperationLatch>>,
}

impl LookupContext {
    pub fn new() -> Self {
        LookupContext {
            depth: 0,
            latch: OperationLatch::new(),
            wait_set: Vec::new(),
        }
    }

    /// Increment the reentrancy depth; returns the new depth (1 = outermost).
    pub fn enter(&mut self) -> usize {
        self.depth += 1;
        self.depth
    }

    /// Decrement the reentrancy depth; returns the remaining depth
    /// (0 = fully unwound).
    pub fn exit(&mut self) -> usize {
        debug_assert!(self.depth > 0, "context exit without matching enter");
        self.depth -= 1;
        self.depth
    }

    pub fn latch(&self) -> &Arc<OperationLatch> {
        &self.latch
    }

    /// Record that this operation returned a partially-hydrated handle owned
    /// by `creator` and must not report completion before it does.
    pub fn note_dependency(&mut self, creator: Arc<OperationLatch>) {
        if !Arc::ptr_eq(&creator, &self.latch) {
            self.wait_set.push(creator);
        }
    }

    pub fn take_wait_set(&mut self) -> Vec<Arc<OperationLatch>> {
        std::mem::take(&mut self.wait_set)
    }
}
