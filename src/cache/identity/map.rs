//! Identity map: global object id to local managed handle.
//!
//! Mutated only under the coordinator's exclusion domain, so a concurrent
//! lookup can never race a concurrent reap of the same id. Double
//! registration is a coordination bug and crashes loudly.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::cache::identity::handle::ManagedHandle;
use crate::cache::types::ObjectId;

#[derive(Default)]
pub(crate) struct IdentityMap {
    entries: HashMap<ObjectId, Arc<ManagedHandle>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        IdentityMap {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&Arc<ManagedHandle>> {
        self.entries.get(&id)
    }

    /// Register a freshly hydrated handle. Panics if the id is already
    /// present: insertion happens exactly once, after successful hydration.
    pub fn put(&mut self, handle: Arc<ManagedHandle>) {
        let id = handle.object_id();
        let old = self.entries.insert(id, handle);
        assert!(
            old.is_none(),
            "double registration of {} in identity map",
            id
        );
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<Arc<ManagedHandle>> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Snapshot of all registered ids; feeds the reconnect handshake.
    pub fn registered_ids(&self) -> BTreeSet<ObjectId> {
        self.entries.keys().copied().collect()
    }
}
