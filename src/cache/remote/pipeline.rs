//! Outbound fetch pipeline: request batching, parked results, and
//! removed-object accounting.
//!
//! The pipeline is pure state plus a [`RemoteStore`] reference; it never
//! blocks and never takes locks of its own. The owning coordinator calls it
//! under its exclusion domain and maps the returned [`FlushAction`]s onto
//! the shared timer, which keeps all scheduling decisions out of the locked
//! region.
//!
//! Request shaping follows two rules: while few lookups are outstanding each
//! request goes out immediately, and once traffic is heavy new lookups are
//! marked pending and coalesced by fetch depth and parent hint on the next
//! flush. Removed
//! ids ride along on whatever request goes out first, with a dedicated
//! removal-only request as fallback.

use std::collections::{BTreeSet, HashMap};

use log::{debug, warn};

use crate::cache::config::FetchConfig;
use crate::cache::remote::batch_lru::DnaBatchLru;
use crate::cache::remote::messages::{ObjectRequest, RemoteStore, REMOVAL_ONLY_DEPTH};
use crate::cache::types::{BatchId, Dna, ObjectId, RequestId};

/// Timer work the coordinator must schedule after a pipeline call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushAction {
    /// Flush pending lookups after the short batching delay.
    ScheduleLookupFlush,
    /// Removed set crossed its threshold; flush it immediately.
    ScheduleRemovedNow,
    /// First removed id since the last flush; flush after the long delay.
    ScheduleRemovedLater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemovedFlush {
    NotScheduled,
    ScheduledLater,
    ScheduledNow,
}

/// One in-flight fetch.
struct FetchState {
    depth: i32,
    parent: Option<ObjectId>,
    /// Created while traffic was heavy; not yet sent.
    pending: bool,
    /// Speculative fetch with no waiter.
    prefetch: bool,
    /// The store confirmed the id does not exist.
    missing: bool,
}

#[derive(Default)]
pub(crate) struct FetchPipeline {
    states: HashMap<ObjectId, FetchState>,
    lru: DnaBatchLru,
    removed: BTreeSet<ObjectId>,
    removed_flush: RemovedFlush,
    lookup_flush_scheduled: bool,
    request_counter: u64,
    hits: u64,
    misses: u64,
}

impl Default for RemovedFlush {
    fn default() -> Self {
        RemovedFlush::NotScheduled
    }
}

impl FetchPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_request_id(&mut self) -> RequestId {
        self.request_counter += 1;
        RequestId(self.request_counter)
    }

    /// Number of lookups with a request on the wire.
    fn in_flight(&self) -> usize {
        self.states.values().filter(|s| !s.pending).count()
    }

    pub fn has_state(&self, id: ObjectId) -> bool {
        self.states.contains_key(&id)
    }

    pub fn is_missing(&self, id: ObjectId) -> bool {
        self.states.get(&id).map_or(false, |s| s.missing)
    }

    /// Consume a parked result if one is available.
    pub fn take_dna(&mut self, id: ObjectId) -> Option<Dna> {
        let dna = self.lru.take(id);
        if dna.is_some() {
            self.hits += 1;
        }
        dna
    }

    /// Drop all bookkeeping for a finished lookup, successful or not.
    pub fn finish_lookup(&mut self, id: ObjectId) {
        self.states.remove(&id);
        self.lru.remove(id);
    }

    /// Record a new fetch and either send it now or queue it for the next
    /// flush. Upgrades an existing prefetch in place instead of re-sending.
    pub fn begin_lookup(
        &mut self,
        id: ObjectId,
        depth: i32,
        parent: Option<ObjectId>,
        prefetch: bool,
        cfg: &FetchConfig,
        store: &dyn RemoteStore,
    ) -> Option<FlushAction> {
        if let Some(state) = self.states.get_mut(&id) {
            // A prefetch already covers this id; attach the waiter to it.
            if state.prefetch && !prefetch {
                state.prefetch = false;
            }
            return None;
        }
        self.misses += 1;
        let send_now = self.in_flight() + 1 <= cfg.max_outstanding_sent_immediately;
        self.states.insert(
            id,
            FetchState {
                depth,
                parent,
                pending: !send_now,
                prefetch,
                missing: false,
            },
        );
        if send_now {
            let mut ids = BTreeSet::new();
            ids.insert(id);
            store.request_managed_objects(ObjectRequest {
                request_id: self.next_request_id(),
                object_ids: ids,
                depth,
                parent_context: parent,
                removed_ids: self.take_removed(),
            });
            None
        } else if !self.lookup_flush_scheduled {
            self.lookup_flush_scheduled = true;
            Some(FlushAction::ScheduleLookupFlush)
        } else {
            None
        }
    }

    /// Send every pending lookup, coalesced by fetch depth and parent hint.
    pub fn flush_pending(&mut self, store: &dyn RemoteStore) {
        self.lookup_flush_scheduled = false;
        let mut groups: HashMap<(i32, Option<ObjectId>), BTreeSet<ObjectId>> = HashMap::new();
        for (id, state) in self.states.iter_mut() {
            if state.pending {
                state.pending = false;
                groups
                    .entry((state.depth, state.parent))
                    .or_default()
                    .insert(*id);
            }
        }
        if groups.is_empty() {
            return;
        }
        let mut removed = self.take_removed();
        for ((depth, parent), object_ids) in groups {
            let request_id = self.next_request_id();
            store.request_managed_objects(ObjectRequest {
                request_id,
                object_ids,
                depth,
                parent_context: parent,
                removed_ids: std::mem::take(&mut removed),
            });
        }
    }

    /// Account one id as no longer held locally. Ids under lookup are
    /// skipped: their fetch is still outstanding and telling the store we
    /// dropped them would be a lie.
    pub fn removed(&mut self, id: ObjectId, cfg: &FetchConfig) -> Option<FlushAction> {
        if self.states.contains_key(&id) {
            warn!("Ignoring removal of {} while its lookup is in flight", id);
            return None;
        }
        self.lru.remove(id);
        self.removed.insert(id);
        self.schedule_removed_flush(cfg)
    }

    fn schedule_removed_flush(&mut self, cfg: &FetchConfig) -> Option<FlushAction> {
        if self.removed.len() >= cfg.removed_objects_threshold
            && self.removed_flush != RemovedFlush::ScheduledNow
        {
            self.removed_flush = RemovedFlush::ScheduledNow;
            Some(FlushAction::ScheduleRemovedNow)
        } else if self.removed_flush == RemovedFlush::NotScheduled {
            self.removed_flush = RemovedFlush::ScheduledLater;
            Some(FlushAction::ScheduleRemovedLater)
        } else {
            None
        }
    }

    /// Send accumulated removals on a dedicated removal-only request.
    pub fn flush_removed(&mut self, store: &dyn RemoteStore) {
        self.removed_flush = RemovedFlush::NotScheduled;
        if self.removed.is_empty() {
            return;
        }
        let request_id = self.next_request_id();
        store.request_managed_objects(ObjectRequest {
            request_id,
            object_ids: BTreeSet::new(),
            depth: REMOVAL_ONLY_DEPTH,
            parent_context: None,
            removed_ids: self.take_removed(),
        });
    }

    fn take_removed(&mut self) -> BTreeSet<ObjectId> {
        if !self.removed.is_empty() {
            self.removed_flush = RemovedFlush::NotScheduled;
        }
        std::mem::take(&mut self.removed)
    }

    /// Park a result batch. Prefetch states it satisfies are retired here
    /// since no waiter will consume them; overflow evicts the oldest batch
    /// and re-routes its unclaimed members through removal accounting.
    ///
    /// Returns a flush action if the evicted members tripped the removed
    /// threshold. Panics if the store re-sends an id we already reported
    /// removed: that is a protocol violation, not a recoverable condition.
    pub fn add_batch(
        &mut self,
        batch: BatchId,
        dnas: Vec<Dna>,
        cfg: &FetchConfig,
    ) -> Option<FlushAction> {
        for dna in &dnas {
            let id = dna.object_id;
            if self.removed.contains(&id) {
                panic!("store sent {} after it was reported removed", id);
            }
            if let Some(state) = self.states.get(&id) {
                if state.prefetch {
                    self.states.remove(&id);
                }
            }
        }
        self.lru.add_batch(batch, dnas);
        let mut action = None;
        for id in self.lru.evict_over(cfg.max_dna_batches) {
            if let Some(a) = self.removed_evicted(id, cfg) {
                action = Some(a);
            }
        }
        action
    }

    fn removed_evicted(&mut self, id: ObjectId, cfg: &FetchConfig) -> Option<FlushAction> {
        if self.states.contains_key(&id) {
            // A waiter still wants this id; its batch was evicted before the
            // waiter woke. The lookup will notice the loss and re-request.
            debug!("Evicted parked result for {} with a lookup in flight", id);
            return None;
        }
        self.removed.insert(id);
        self.schedule_removed_flush(cfg)
    }

    /// Record store-confirmed absences. Prefetch misses are dropped
    /// silently; lookups with waiters get flagged so the waiter can fail
    /// with a typed not-found.
    pub fn objects_not_found(&mut self, missing: &BTreeSet<ObjectId>) {
        for id in missing {
            match self.states.get_mut(id) {
                None => debug!("Not-found response for {} with no lookup in flight", id),
                Some(state) if state.prefetch => {
                    self.states.remove(id);
                }
                Some(state) => state.missing = true,
            }
        }
    }

    /// Drop unconsumed results and removal accounting; in-flight lookups
    /// survive and are replayed on resume.
    pub fn clear_for_pause(&mut self) {
        self.lru.clear();
        self.removed.clear();
        self.removed_flush = RemovedFlush::NotScheduled;
        self.lookup_flush_scheduled = false;
    }

    /// Re-send every surviving lookup after a resume, coalesced like a flush.
    pub fn request_outstanding(&mut self, store: &dyn RemoteStore) {
        let mut groups: HashMap<(i32, Option<ObjectId>), BTreeSet<ObjectId>> = HashMap::new();
        for (id, state) in self.states.iter_mut() {
            if state.missing {
                continue;
            }
            state.pending = false;
            groups
                .entry((state.depth, state.parent))
                .or_default()
                .insert(*id);
        }
        for ((depth, parent), object_ids) in groups {
            let request_id = self.next_request_id();
            store.request_managed_objects(ObjectRequest {
                request_id,
                object_ids,
                depth,
                parent_context: parent,
                removed_ids: BTreeSet::new(),
            });
        }
    }

    /// Periodic sweep of result batches untouched for two cycles.
    pub fn sweep_unused_batches(&mut self, cfg: &FetchConfig) -> Option<FlushAction> {
        let mut action = None;
        for id in self.lru.sweep_unaccessed() {
            if let Some(a) = self.removed_evicted(id, cfg) {
                action = Some(a);
            }
        }
        action
    }

    pub fn cache_hits(&self) -> u64 {
        self.hits
    }

    pub fn cache_misses(&self) -> u64 {
        self.misses
    }

    #[cfg(test)]
    pub fn removed_len(&self) -> usize {
        self.removed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::remote::messages::test_support::RecordingStore;

    fn cfg() -> FetchConfig {
        FetchConfig::default()
    }

    fn dna(seq: i64) -> Dna {
        Dna::new(ObjectId::new(0, seq), 1, "demo.Node")
    }

    #[test]
    fn light_traffic_sends_immediately() {
        let store = RecordingStore::new();
        let mut p = FetchPipeline::new();
        let action = p.begin_lookup(ObjectId::new(0, 1), 500, None, false, &cfg(), &*store);
        assert_eq!(action, None);
        assert_eq!(store.object_request_count(), 1);
        let req = store.object_requests.lock().unwrap()[0].clone();
        assert_eq!(req.depth, 500);
        assert!(req.object_ids.contains(&ObjectId::new(0, 1)));
    }

    #[test]
    fn heavy_traffic_batches_by_depth() {
        let store = RecordingStore::new();
        let mut c = cfg();
        c.max_outstanding_sent_immediately = 0;
        let mut p = FetchPipeline::new();

        let first = p.begin_lookup(ObjectId::new(0, 1), 500, None, false, &c, &*store);
        assert_eq!(first, Some(FlushAction::ScheduleLookupFlush));
        // Only the first pending lookup schedules the flush.
        assert_eq!(
            p.begin_lookup(ObjectId::new(0, 2), 500, None, false, &c, &*store),
            None
        );
        assert_eq!(
            p.begin_lookup(ObjectId::new(0, 3), 1, None, false, &c, &*store),
            None
        );
        assert_eq!(store.object_request_count(), 0);

        p.flush_pending(&*store);
        let reqs = store.object_requests.lock().unwrap();
        assert_eq!(reqs.len(), 2);
        let deep = reqs.iter().find(|r| r.depth == 500).unwrap();
        assert_eq!(deep.object_ids.len(), 2);
        let shallow = reqs.iter().find(|r| r.depth == 1).unwrap();
        assert_eq!(shallow.object_ids.len(), 1);
    }

    #[test]
    fn flush_preserves_the_parent_hint() {
        let store = RecordingStore::new();
        let mut c = cfg();
        c.max_outstanding_sent_immediately = 0;
        let mut p = FetchPipeline::new();
        let parent = ObjectId::new(0, 100);
        p.begin_lookup(ObjectId::new(0, 1), 500, Some(parent), false, &c, &*store);
        p.begin_lookup(ObjectId::new(0, 2), 500, Some(parent), false, &c, &*store);
        p.begin_lookup(ObjectId::new(0, 3), 500, None, false, &c, &*store);

        p.flush_pending(&*store);
        let reqs = store.object_requests.lock().unwrap();
        assert_eq!(reqs.len(), 2);
        let hinted = reqs
            .iter()
            .find(|r| r.parent_context == Some(parent))
            .unwrap();
        assert_eq!(hinted.object_ids.len(), 2);
        assert!(reqs.iter().any(|r| r.parent_context.is_none()));
    }

    #[test]
    fn duplicate_lookup_produces_no_second_request() {
        let store = RecordingStore::new();
        let mut p = FetchPipeline::new();
        let id = ObjectId::new(0, 7);
        p.begin_lookup(id, 500, None, false, &cfg(), &*store);
        p.begin_lookup(id, 500, None, false, &cfg(), &*store);
        assert_eq!(store.object_request_count(), 1);
    }

    #[test]
    fn waiter_upgrades_prefetch_in_place() {
        let store = RecordingStore::new();
        let mut p = FetchPipeline::new();
        let id = ObjectId::new(0, 7);
        p.begin_lookup(id, 500, None, true, &cfg(), &*store);
        p.begin_lookup(id, 500, None, false, &cfg(), &*store);
        assert_eq!(store.object_request_count(), 1);

        // Once upgraded, an arriving batch must not retire the state.
        p.add_batch(BatchId(1), vec![dna(7)], &cfg());
        assert!(p.has_state(id));
        assert_eq!(p.take_dna(id).unwrap().object_id, id);
    }

    #[test]
    fn prefetch_result_retires_its_state() {
        let store = RecordingStore::new();
        let mut p = FetchPipeline::new();
        let id = ObjectId::new(0, 7);
        p.begin_lookup(id, 500, None, true, &cfg(), &*store);
        p.add_batch(BatchId(1), vec![dna(7)], &cfg());
        assert!(!p.has_state(id));
        // The parked result is still consumable by a later lookup.
        assert!(p.take_dna(id).is_some());
    }

    #[test]
    fn removals_ride_on_next_request() {
        let store = RecordingStore::new();
        let mut p = FetchPipeline::new();
        let action = p.removed(ObjectId::new(0, 9), &cfg());
        assert_eq!(action, Some(FlushAction::ScheduleRemovedLater));
        // Second removal before the flush fires does not reschedule.
        assert_eq!(p.removed(ObjectId::new(0, 10), &cfg()), None);

        p.begin_lookup(ObjectId::new(0, 1), 500, None, false, &cfg(), &*store);
        let req = store.object_requests.lock().unwrap()[0].clone();
        assert_eq!(req.removed_ids.len(), 2);
        assert_eq!(p.removed_len(), 0);
    }

    #[test]
    fn removed_threshold_forces_immediate_flush() {
        let store = RecordingStore::new();
        let mut c = cfg();
        c.removed_objects_threshold = 3;
        let mut p = FetchPipeline::new();
        assert_eq!(
            p.removed(ObjectId::new(0, 1), &c),
            Some(FlushAction::ScheduleRemovedLater)
        );
        assert_eq!(p.removed(ObjectId::new(0, 2), &c), None);
        assert_eq!(
            p.removed(ObjectId::new(0, 3), &c),
            Some(FlushAction::ScheduleRemovedNow)
        );

        p.flush_removed(&*store);
        let reqs = store.object_requests.lock().unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].depth, REMOVAL_ONLY_DEPTH);
        assert!(reqs[0].object_ids.is_empty());
        assert_eq!(reqs[0].removed_ids.len(), 3);
    }

    #[test]
    fn removal_of_in_flight_lookup_is_ignored() {
        let store = RecordingStore::new();
        let mut p = FetchPipeline::new();
        let id = ObjectId::new(0, 5);
        p.begin_lookup(id, 500, None, false, &cfg(), &*store);
        assert_eq!(p.removed(id, &cfg()), None);
        assert_eq!(p.removed_len(), 0);
    }

    #[test]
    fn lru_overflow_accounts_unclaimed_members_as_removed() {
        let store = RecordingStore::new();
        let mut c = cfg();
        c.max_dna_batches = 1;
        let mut p = FetchPipeline::new();
        p.begin_lookup(ObjectId::new(0, 1), 500, None, false, &c, &*store);
        p.add_batch(BatchId(1), vec![dna(1), dna(2)], &c);
        // Waiter consumes its record; the extra member stays parked.
        p.take_dna(ObjectId::new(0, 1)).unwrap();
        p.finish_lookup(ObjectId::new(0, 1));

        let action = p.add_batch(BatchId(2), vec![dna(3)], &c);
        assert_eq!(action, Some(FlushAction::ScheduleRemovedLater));
        assert_eq!(p.removed_len(), 1);
        assert!(p.take_dna(ObjectId::new(0, 2)).is_none());
        assert!(p.take_dna(ObjectId::new(0, 3)).is_some());
    }

    #[test]
    #[should_panic(expected = "after it was reported removed")]
    fn batch_containing_removed_id_panics() {
        let mut p = FetchPipeline::new();
        p.removed(ObjectId::new(0, 4), &cfg());
        p.add_batch(BatchId(1), vec![dna(4)], &cfg());
    }

    #[test]
    fn not_found_flags_waiters_and_drops_prefetches() {
        let store = RecordingStore::new();
        let mut p = FetchPipeline::new();
        let waited = ObjectId::new(0, 1);
        let prefetched = ObjectId::new(0, 2);
        p.begin_lookup(waited, 500, None, false, &cfg(), &*store);
        p.begin_lookup(prefetched, 500, None, true, &cfg(), &*store);

        let missing: BTreeSet<_> = [waited, prefetched, ObjectId::new(0, 99)]
            .into_iter()
            .collect();
        p.objects_not_found(&missing);
        assert!(p.is_missing(waited));
        assert!(!p.has_state(prefetched));
    }

    #[test]
    fn resume_replays_surviving_lookups() {
        let store = RecordingStore::new();
        let mut c = cfg();
        c.max_outstanding_sent_immediately = 0;
        let mut p = FetchPipeline::new();
        p.begin_lookup(ObjectId::new(0, 1), 500, None, false, &c, &*store);
        p.begin_lookup(ObjectId::new(0, 2), 500, None, false, &c, &*store);
        p.removed(ObjectId::new(0, 9), &c);

        p.clear_for_pause();
        assert_eq!(p.removed_len(), 0);
        assert_eq!(store.object_request_count(), 0);

        p.request_outstanding(&*store);
        let reqs = store.object_requests.lock().unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].object_ids.len(), 2);
    }

    #[test]
    fn sweep_drops_idle_batches_into_removal_accounting() {
        let mut c = cfg();
        let mut p = FetchPipeline::new();
        c.max_dna_batches = 10;
        p.add_batch(BatchId(1), vec![dna(1)], &c);
        assert_eq!(p.sweep_unused_batches(&c), None);
        assert_eq!(
            p.sweep_unused_batches(&c),
            Some(FlushAction::ScheduleRemovedLater)
        );
        assert_eq!(p.removed_len(), 1);
    }
}
