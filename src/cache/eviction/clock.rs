//! Clock (second-chance) eviction policy.
//!
//! Handles are kept in a ring of weak references walked by a single hand.
//! A handle touched since the last pass gets its accessed flag cleared and
//! one more trip around the ring; an untouched, committed, unclaimed handle
//! is offered as a candidate. Handles whose identity entry was removed are
//! tombstoned and dropped when the hand reaches them, so removal stays O(1).

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use crate::cache::eviction::policy::EvictionPolicy;
use crate::cache::identity::ManagedHandle;
use crate::cache::types::ObjectId;

#[derive(Default)]
struct ClockInner {
    ring: VecDeque<Weak<ManagedHandle>>,
    tombstones: HashSet<ObjectId>,
}

#[derive(Default)]
pub struct ClockEvictionPolicy {
    inner: Mutex<ClockInner>,
}

impl ClockEvictionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn ring_len(&self) -> usize {
        self.inner.lock().unwrap().ring.len()
    }
}

impl EvictionPolicy for ClockEvictionPolicy {
    fn notify_added(&self, handle: &Arc<ManagedHandle>) {
        let mut inner = self.inner.lock().expect("clock lock poisoned");
        inner.tombstones.remove(&handle.object_id());
        inner.ring.push_back(Arc::downgrade(handle));
    }

    fn notify_removed(&self, id: ObjectId) {
        let mut inner = self.inner.lock().expect("clock lock poisoned");
        inner.tombstones.insert(id);
    }

    fn removal_candidates(&self, max: usize) -> Vec<Arc<ManagedHandle>> {
        let mut inner = self.inner.lock().expect("clock lock poisoned");
        let mut candidates = Vec::new();
        let mut selected = HashSet::new();
        // At most two revolutions per call: one to burn second chances, one
        // to select. More would only revisit handles already offered.
        let mut remaining = inner.ring.len() * 2;
        while candidates.len() < max && remaining > 0 {
            remaining -= 1;
            let weak = match inner.ring.pop_front() {
                Some(weak) => weak,
                None => break,
            };
            let handle = match weak.upgrade() {
                Some(handle) => handle,
                None => continue,
            };
            if inner.tombstones.remove(&handle.object_id()) {
                continue;
            }
            // Already offered this call; the second revolution must not
            // produce duplicates.
            if selected.contains(&handle.object_id()) {
                inner.ring.push_back(weak);
                continue;
            }
            if handle.is_new() || handle.is_eviction_in_progress() {
                inner.ring.push_back(weak);
                continue;
            }
            if handle.take_recently_accessed() {
                // Second chance.
                inner.ring.push_back(weak);
                continue;
            }
            inner.ring.push_back(weak);
            selected.insert(handle.object_id());
            candidates.push(handle);
        }
        candidates
    }
}
