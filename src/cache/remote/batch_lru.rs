//! Bounded store of fetched-but-unconsumed DNA batches.
//!
//! The server answers fetch requests with whole batches; members the client
//! has not yet consumed are parked here keyed by object id. The store is
//! bounded by batch count: when it overflows, the oldest batch is dropped
//! and its unclaimed members are reported so the caller can account for
//! them as removed. A periodic sweep also drops batches that have gone two
//! consecutive cycles without a single member access.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::cache::types::{BatchId, Dna, ObjectId};

struct BatchEntry {
    batch: BatchId,
    members: HashSet<ObjectId>,
    accessed: bool,
}

#[derive(Default)]
pub(crate) struct DnaBatchLru {
    /// Parked records, keyed by object id.
    records: HashMap<ObjectId, Dna>,
    /// Which batch each parked id belongs to.
    index: HashMap<ObjectId, BatchId>,
    /// Batches in arrival order, oldest first.
    batches: VecDeque<BatchEntry>,
}

impl DnaBatchLru {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.records.contains_key(&id)
    }

    /// Park one batch of records. Panics if any member is already parked:
    /// the server must never re-send an object the client still holds.
    pub fn add_batch(&mut self, batch: BatchId, dnas: Vec<Dna>) {
        let mut members = HashSet::with_capacity(dnas.len());
        for dna in dnas {
            let id = dna.object_id;
            if self.records.insert(id, dna).is_some() {
                panic!("duplicate parked record for {}", id);
            }
            self.index.insert(id, batch);
            members.insert(id);
        }
        self.batches.push_back(BatchEntry {
            batch,
            members,
            accessed: true,
        });
    }

    /// Consume one parked record, marking its batch as accessed.
    pub fn take(&mut self, id: ObjectId) -> Option<Dna> {
        let dna = self.records.remove(&id)?;
        if let Some(batch) = self.index.remove(&id) {
            if let Some(entry) = self.batches.iter_mut().find(|e| e.batch == batch) {
                entry.members.remove(&id);
                entry.accessed = true;
                if entry.members.is_empty() {
                    self.batches.retain(|e| e.batch != batch);
                }
            }
        }
        Some(dna)
    }

    /// Drop a parked record without consuming it, e.g. when the id is
    /// removed while parked.
    pub fn remove(&mut self, id: ObjectId) {
        if self.records.remove(&id).is_some() {
            if let Some(batch) = self.index.remove(&id) {
                if let Some(entry) = self.batches.iter_mut().find(|e| e.batch == batch) {
                    entry.members.remove(&id);
                    if entry.members.is_empty() {
                        self.batches.retain(|e| e.batch != batch);
                    }
                }
            }
        }
    }

    /// Evict oldest batches until at most `max` remain, returning the ids of
    /// every unclaimed member dropped.
    pub fn evict_over(&mut self, max: usize) -> Vec<ObjectId> {
        let mut dropped = Vec::new();
        while self.batches.len() > max {
            let entry = self.batches.pop_front().expect("non-empty batch queue");
            for id in entry.members {
                self.records.remove(&id);
                self.index.remove(&id);
                dropped.push(id);
            }
        }
        dropped
    }

    /// Drop batches untouched since the previous sweep and clear the access
    /// flag on survivors. Returns the ids of every dropped member.
    pub fn sweep_unaccessed(&mut self) -> Vec<ObjectId> {
        let mut dropped = Vec::new();
        let mut kept = VecDeque::with_capacity(self.batches.len());
        for mut entry in self.batches.drain(..) {
            if entry.accessed {
                entry.accessed = false;
                kept.push_back(entry);
            } else {
                for id in entry.members {
                    self.records.remove(&id);
                    self.index.remove(&id);
                    dropped.push(id);
                }
            }
        }
        self.batches = kept;
        dropped
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
        self.batches.clear();
    }
}
