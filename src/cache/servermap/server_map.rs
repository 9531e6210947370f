//! One shared server map: local cache in front, remote manager behind.
//!
//! Reads pick their durability explicitly. Coherent reads are tagged with
//! the lock the caller holds and stay valid until that lock is invalidated;
//! eventual reads are invalidated by change broadcast; incoherent reads are
//! cheapest and only time out. Writes update the local entry
//! opportunistically, and a value that is itself a managed object must have
//! been shared with the cluster first so the cached entry carries a
//! resolvable id.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::config::ServerMapConfig;
use crate::cache::servermap::local_cache::ServerMapLocalCache;
use crate::cache::servermap::remote::RemoteServerMapManager;
use crate::cache::types::{FaultError, LockId, MapValue, ObjectId};

pub struct ServerMap {
    map_id: ObjectId,
    local: ServerMapLocalCache,
    remote: Arc<RemoteServerMapManager>,
    config: ServerMapConfig,
}

fn check_cacheable(value: &MapValue) {
    if let Some(id) = value.shared_id() {
        assert!(
            !id.is_null(),
            "shared map value must carry a resolvable object id"
        );
    }
}

impl ServerMap {
    pub fn new(
        map_id: ObjectId,
        remote: Arc<RemoteServerMapManager>,
        config: ServerMapConfig,
    ) -> Self {
        ServerMap {
            map_id,
            local: ServerMapLocalCache::new(),
            remote,
            config,
        }
    }

    pub fn map_id(&self) -> ObjectId {
        self.map_id
    }

    pub fn local_entry_count(&self) -> usize {
        self.local.len()
    }

    fn incoherent_timeout(&self) -> Duration {
        Duration::from_millis(self.config.incoherent_read_timeout_ms)
    }

    fn fetch_one(&self, key: &str) -> Result<Option<MapValue>, FaultError> {
        let mut keys = BTreeSet::new();
        keys.insert(key.to_string());
        let mut values = self.remote.get_values(self.map_id, keys)?;
        Ok(values.remove(key))
    }

    /// Read under a held lock. The cached entry is valid until the lock is
    /// invalidated.
    pub fn get_value_coherent(
        &self,
        lock: LockId,
        key: &str,
    ) -> Result<Option<MapValue>, FaultError> {
        if let Some(value) = self.local.get_coherent_local(key) {
            return Ok(Some(value));
        }
        match self.fetch_one(key)? {
            Some(value) => {
                check_cacheable(&value);
                self.local.put_strong(key, value.clone(), lock);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Unlocked read with change-broadcast invalidation.
    pub fn get_value_eventual(&self, key: &str) -> Result<Option<MapValue>, FaultError> {
        if let Some(value) = self.local.get_coherent_local(key) {
            return Ok(Some(value));
        }
        match self.fetch_one(key)? {
            Some(value) => {
                check_cacheable(&value);
                self.local.put_eventual(key, value.clone());
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Unlocked best-effort read; served entries may be stale up to the
    /// configured timeout.
    pub fn get_value_incoherent(&self, key: &str) -> Result<Option<MapValue>, FaultError> {
        if let Some(value) = self.local.get_local(key, self.incoherent_timeout()) {
            return Ok(Some(value));
        }
        match self.fetch_one(key)? {
            Some(value) => {
                check_cacheable(&value);
                self.local.put_incoherent(key, value.clone());
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Fetch many keys in one round trip. Bypasses the local cache; callers
    /// wanting cached reads iterate the single-key operations.
    pub fn get_all_values(
        &self,
        keys: BTreeSet<String>,
    ) -> Result<HashMap<String, MapValue>, FaultError> {
        self.remote.get_values(self.map_id, keys)
    }

    pub fn get_size(&self) -> Result<u64, FaultError> {
        self.remote.get_size(vec![self.map_id])
    }

    pub fn get_all_keys(&self) -> Result<BTreeSet<String>, FaultError> {
        self.remote.get_all_keys(self.map_id)
    }

    // --- write-path notifications ----------------------------------------

    /// A locked put committed; cache the new value under the lock.
    pub fn note_put_coherent(&self, lock: LockId, key: &str, value: MapValue) {
        check_cacheable(&value);
        self.local.put_strong(key, value, lock);
    }

    pub fn note_put_eventual(&self, key: &str, value: MapValue) {
        check_cacheable(&value);
        self.local.put_eventual(key, value);
    }

    pub fn note_put_incoherent(&self, key: &str, value: MapValue) {
        check_cacheable(&value);
        self.local.put_incoherent(key, value);
    }

    pub fn note_remove(&self, key: &str) {
        self.local.remove(key);
    }

    // --- invalidation ----------------------------------------------------

    pub fn invalidate_lock(&self, lock: LockId) {
        self.local.invalidate_lock(lock);
    }

    /// Change broadcast from the cluster naming modified keys.
    pub fn invalidate_keys<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.local.invalidate_keys(keys);
    }

    pub fn clear_local(&self) {
        self.local.clear();
    }
}
