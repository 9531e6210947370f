//! Per-map local cache for large shared key/value collections.
//!
//! Entries are keyed by application key and tagged with their durability
//! mode. Exactly one representation backs a key at a time; writing a new
//! representation evicts the previous one, including its lock-index link,
//! so a key can never be served under a weaker guarantee than the caller
//! asked for.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::cache::types::{LockId, MapValue};

/// One cached value and the durability it was written under.
#[derive(Debug, Clone)]
pub(crate) enum LocalCacheValue {
    /// Valid while the tagging lock is held; invalidated with the lock.
    Strong { lock: LockId, value: MapValue },
    /// Valid until an explicit change broadcast names the key.
    Eventual { value: MapValue },
    /// Best effort; recycled lazily once older than the read timeout.
    Incoherent { value: MapValue, cached_at: Instant },
}

impl LocalCacheValue {
    fn value(&self) -> &MapValue {
        match self {
            LocalCacheValue::Strong { value, .. } => value,
            LocalCacheValue::Eventual { value } => value,
            LocalCacheValue::Incoherent { value, .. } => value,
        }
    }
}

#[derive(Default)]
pub(crate) struct ServerMapLocalCache {
    entries: DashMap<String, LocalCacheValue>,
    /// Which keys each lock currently protects.
    lock_index: Mutex<HashMap<LockId, HashSet<String>>>,
}

impl ServerMapLocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn unlink(&self, key: &str, old: &LocalCacheValue) {
        if let LocalCacheValue::Strong { lock, .. } = old {
            let mut index = self.lock_index.lock().expect("lock index poisoned");
            if let Some(keys) = index.get_mut(lock) {
                keys.remove(key);
                if keys.is_empty() {
                    index.remove(lock);
                }
            }
        }
    }

    fn install(&self, key: String, value: LocalCacheValue) {
        // Retire the previous representation first so re-tagging a key under
        // the same lock cannot unlink the fresh index entry.
        self.remove(&key);
        if let LocalCacheValue::Strong { lock, .. } = &value {
            self.lock_index
                .lock()
                .expect("lock index poisoned")
                .entry(*lock)
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(key, value);
    }

    pub fn put_strong(&self, key: impl Into<String>, value: MapValue, lock: LockId) {
        self.install(key.into(), LocalCacheValue::Strong { lock, value });
    }

    pub fn put_eventual(&self, key: impl Into<String>, value: MapValue) {
        self.install(key.into(), LocalCacheValue::Eventual { value });
    }

    pub fn put_incoherent(&self, key: impl Into<String>, value: MapValue) {
        self.install(
            key.into(),
            LocalCacheValue::Incoherent {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    /// Any-representation read. Incoherent entries older than
    /// `incoherent_timeout` are recycled instead of served.
    pub fn get_local(&self, key: &str, incoherent_timeout: Duration) -> Option<MapValue> {
        let stale = {
            let entry = self.entries.get(key)?;
            match &*entry {
                LocalCacheValue::Incoherent { cached_at, .. } => {
                    cached_at.elapsed() >= incoherent_timeout
                }
                _ => false,
            }
        };
        if stale {
            self.remove(key);
            return None;
        }
        // Ref::value would return the LocalCacheValue itself; deref first.
        self.entries.get(key).map(|entry| (*entry).value().clone())
    }

    /// Read that never serves an incoherent entry.
    pub fn get_coherent_local(&self, key: &str) -> Option<MapValue> {
        let entry = self.entries.get(key)?;
        match &*entry {
            LocalCacheValue::Incoherent { .. } => None,
            other => Some(other.value().clone()),
        }
    }

    pub fn remove(&self, key: &str) {
        if let Some((_, old)) = self.entries.remove(key) {
            self.unlink(key, &old);
        }
    }

    /// The lock was released or recalled; every key it protected goes.
    pub fn invalidate_lock(&self, lock: LockId) {
        let keys = self
            .lock_index
            .lock()
            .expect("lock index poisoned")
            .remove(&lock);
        if let Some(keys) = keys {
            for key in keys {
                self.entries.remove(&key);
            }
        }
    }

    /// Change broadcast: drop the named keys if cached eventually. Strong
    /// entries stay, their lock still guarantees them.
    pub fn invalidate_keys<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for key in keys {
            let key = key.as_ref();
            let eventual = self
                .entries
                .get(key)
                .map_or(false, |e| matches!(&*e, LocalCacheValue::Eventual { .. }));
            if eventual {
                self.entries.remove(key);
            }
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.lock_index.lock().expect("lock index poisoned").clear();
    }
}
