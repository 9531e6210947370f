//! The lookup coordinator: one exclusion domain tying together the identity
//! map, the per-id gates, root bindings, and the fetch pipeline.
//!
//! All shared state lives in [`CoreState`] behind a single mutex per manager
//! instance, with one condition variable for every waiter class. This is
//! what linearizes removal and re-fetch of the same id: a gate's existence,
//! checked and mutated under that lock, is the sole arbiter of "this id is
//! currently being resolved."
//!
//! Blocking waits are bounded poll-and-recheck loops so lifecycle
//! transitions are observed promptly, and fetches stuck past the poll
//! interval are logged rather than silently hung.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use log::{debug, warn};

use crate::cache::config::FaultlineConfig;
use crate::cache::coordinator::lookup_context::LookupContext;
use crate::cache::coordinator::lookup_state::{GatePhase, LookupGate};
use crate::cache::eviction::EvictionPolicy;
use crate::cache::identity::map::IdentityMap;
use crate::cache::identity::{ManagedHandle, ManagedPeer, PeerFactory, PeerRef, ReferenceResolver};
use crate::cache::remote::pipeline::{FetchPipeline, FlushAction};
use crate::cache::remote::{RemoteStore, SessionManager};
use crate::cache::types::{BatchId, Dna, FaultError, ObjectId, RunState, SessionId};
use crate::cache::worker::TaskTimer;

/// Hook into the transaction subsystem: mutation logging is suspended for
/// the duration of a logical lookup so hydration writes are not mistaken
/// for application mutations.
pub trait TransactionObserver: Send + Sync {
    fn suspend_logging(&self);
    fn resume_logging(&self);
}

/// Observer for runtimes without a transaction log.
pub struct NoopTransactionObserver;

impl TransactionObserver for NoopTransactionObserver {
    fn suspend_logging(&self) {}

    fn resume_logging(&self) {}
}

/// Source of fresh object ids for locally created objects (new roots).
pub trait ObjectIdProvider: Send + Sync {
    fn next_object_id(&self) -> ObjectId;
}

/// Sequential id provider scoped to one group; suitable for single-client
/// deployments and tests. Clustered runtimes replace this with a provider
/// backed by server-granted id ranges.
pub struct LocalObjectIdProvider {
    group: u8,
    next: AtomicI64,
}

impl LocalObjectIdProvider {
    pub fn new(group: u8) -> Self {
        LocalObjectIdProvider {
            group,
            next: AtomicI64::new(1),
        }
    }
}

impl ObjectIdProvider for LocalObjectIdProvider {
    fn next_object_id(&self) -> ObjectId {
        ObjectId::new(self.group, self.next.fetch_add(1, Ordering::Relaxed))
    }
}

struct RootBinding {
    id: ObjectId,
    /// Finalized roots never move ids; replacement requests are ignored.
    finalized: bool,
}

struct CoreState {
    run_state: RunState,
    identity: IdentityMap,
    gates: HashMap<ObjectId, Arc<LookupGate>>,
    roots: HashMap<String, RootBinding>,
    /// Root names currently inside `lookup_or_create_root`.
    root_lookups: HashSet<String>,
    /// In-flight remote root fetches; `Some` holds an unconsumed answer
    /// (NULL meaning the root does not exist remotely).
    root_requests: HashMap<String, Option<ObjectId>>,
    pipeline: FetchPipeline,
}

struct CoreShared {
    lock: Mutex<CoreState>,
    cond: Condvar,
}

pub struct ClientObjectManager {
    shared: CoreShared,
    transport: Arc<dyn RemoteStore>,
    peer_factory: Arc<dyn PeerFactory>,
    txn: Arc<dyn TransactionObserver>,
    policy: Arc<dyn EvictionPolicy>,
    config: FaultlineConfig,
    sessions: Arc<SessionManager>,
    timer: Arc<TaskTimer>,
    reap_tx: Sender<ObjectId>,
    weak_self: Weak<ClientObjectManager>,
}

impl ClientObjectManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FaultlineConfig,
        transport: Arc<dyn RemoteStore>,
        peer_factory: Arc<dyn PeerFactory>,
        txn: Arc<dyn TransactionObserver>,
        policy: Arc<dyn EvictionPolicy>,
        sessions: Arc<SessionManager>,
        timer: Arc<TaskTimer>,
        reap_tx: Sender<ObjectId>,
    ) -> Arc<Self> {
        let sweep_period = Duration::from_millis(config.fetch.unused_batch_sweep_ms);
        let mgr = Arc::new_cyclic(|weak| ClientObjectManager {
            shared: CoreShared {
                lock: Mutex::new(CoreState {
                    run_state: RunState::Running,
                    identity: IdentityMap::new(),
                    gates: HashMap::new(),
                    roots: HashMap::new(),
                    root_lookups: HashSet::new(),
                    root_requests: HashMap::new(),
                    pipeline: FetchPipeline::new(),
                }),
                cond: Condvar::new(),
            },
            transport,
            peer_factory,
            txn,
            policy,
            config,
            sessions,
            timer,
            reap_tx,
            weak_self: weak.clone(),
        });
        let weak = Arc::downgrade(&mgr);
        mgr.timer.schedule_repeating(sweep_period, move || {
            if let Some(mgr) = weak.upgrade() {
                mgr.sweep_unused_batches();
            }
        });
        mgr
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.shared.lock.lock().expect("core lock poisoned")
    }

    fn wait_bounded<'a>(&self, st: MutexGuard<'a, CoreState>) -> MutexGuard<'a, CoreState> {
        let poll = Duration::from_millis(self.config.fetch.concurrent_lookup_poll_ms);
        let (guard, _) = self
            .shared
            .cond
            .wait_timeout(st, poll)
            .expect("core lock poisoned");
        guard
    }

    // --- lookup ---------------------------------------------------------

    /// Fault in `id`, fetching it from the remote store if necessary.
    pub fn lookup(&self, id: ObjectId) -> Result<PeerRef, FaultError> {
        let mut cx = LookupContext::new();
        self.lookup_with_context(id, &mut cx, None, false)
    }

    /// Like [`lookup`](Self::lookup) but failures are not logged; for
    /// callers probing ids that may legitimately be gone.
    pub fn lookup_quiet(&self, id: ObjectId) -> Result<PeerRef, FaultError> {
        let mut cx = LookupContext::new();
        self.lookup_with_context(id, &mut cx, None, true)
    }

    /// Return the peer only if it is already materialized locally.
    pub fn lookup_if_local(&self, id: ObjectId) -> Option<PeerRef> {
        let st = self.lock();
        let handle = Arc::clone(st.identity.get(id)?);
        let peer = handle.peer()?;
        handle.mark_accessed();
        Some(PeerRef::new(peer, handle, self.reap_tx.clone()))
    }

    /// Speculatively fetch `id` with no waiter attached. Arrivals are parked
    /// for a later lookup; not-found responses are discarded silently.
    pub fn prefetch(&self, id: ObjectId) {
        if id.is_null() {
            return;
        }
        assert_eq!(
            id.group(),
            self.config.group,
            "prefetch of {} outside group {}",
            id,
            self.config.group
        );
        let mut st = self.lock();
        if st.run_state != RunState::Running {
            return;
        }
        if st.identity.contains(id) || st.gates.contains_key(&id) {
            return;
        }
        let action = st.pipeline.begin_lookup(
            id,
            self.config.default_fetch_depth as i32,
            None,
            true,
            &self.config.fetch,
            &*self.transport,
        );
        self.apply_flush_action(action);
    }

    pub(crate) fn lookup_with_context(
        &self,
        id: ObjectId,
        cx: &mut LookupContext,
        parent: Option<ObjectId>,
        quiet: bool,
    ) -> Result<PeerRef, FaultError> {
        assert!(!id.is_null(), "lookup of the null object id");
        assert_eq!(
            id.group(),
            self.config.group,
            "lookup of {} outside group {}",
            id,
            self.config.group
        );
        self.begin_operation(cx);
        let result = self.lookup_inner(id, cx, parent, quiet);
        self.end_operation(cx);
        result
    }

    fn begin_operation(&self, cx: &mut LookupContext) {
        if cx.enter() == 1 {
            self.txn.suspend_logging();
            cx.latch().reset();
        }
    }

    fn end_operation(&self, cx: &mut LookupContext) {
        if cx.exit() == 0 {
            cx.latch().release();
            // Completion is reported only after every creation this
            // traversal leaned on has itself completed.
            for latch in cx.take_wait_set() {
                latch.acquire();
            }
            self.txn.resume_logging();
        }
    }

    fn lookup_inner(
        &self,
        id: ObjectId,
        cx: &mut LookupContext,
        parent: Option<ObjectId>,
        quiet: bool,
    ) -> Result<PeerRef, FaultError> {
        let gate = {
            let mut st = self.lock();
            loop {
                if st.run_state == RunState::Stopped {
                    return Err(FaultError::ShuttingDown);
                }
                if let Some(handle) = st.identity.get(id).cloned() {
                    if let Some(peer) = handle.peer() {
                        handle.mark_accessed();
                        return Ok(PeerRef::new(peer, handle, self.reap_tx.clone()));
                    }
                    // Peer reclaimed but the reaper has not caught up yet:
                    // retire the entry here and fall through to a fresh fetch.
                    st.identity.remove(id);
                    self.policy.notify_removed(id);
                    let action = st.pipeline.removed(id, &self.config.fetch);
                    self.apply_flush_action(action);
                    continue;
                }
                match st.gates.get(&id).cloned() {
                    Some(gate) => match gate.phase() {
                        GatePhase::Create => {
                            if let Some(handle) = gate.handle() {
                                if let Some(peer) = handle.peer() {
                                    // Possibly partially hydrated; taking it
                                    // is what lets cyclic graphs resolve,
                                    // provided we defer our own completion.
                                    cx.note_dependency(Arc::clone(gate.creator_latch()));
                                    handle.mark_accessed();
                                    return Ok(PeerRef::new(
                                        peer,
                                        handle,
                                        self.reap_tx.clone(),
                                    ));
                                }
                            }
                            st = self.wait_bounded(st);
                        }
                        GatePhase::Failed => {
                            return Err(self.gate_error(&gate, id));
                        }
                        GatePhase::Lookup | GatePhase::Resolved => {
                            st = self.wait_bounded(st);
                            // The owner may have failed and retired the gate
                            // while we slept; the kept clone still says so.
                            if gate.phase() == GatePhase::Failed {
                                return Err(self.gate_error(&gate, id));
                            }
                        }
                    },
                    None => {
                        let gate = LookupGate::new(Arc::clone(cx.latch()));
                        st.gates.insert(id, Arc::clone(&gate));
                        break gate;
                    }
                }
            }
        };
        self.fault_in(id, gate, cx, parent, quiet)
    }

    fn gate_error(&self, gate: &LookupGate, id: ObjectId) -> FaultError {
        gate.error()
            .unwrap_or_else(|| FaultError::lookup_failed(format!("lookup of {} failed", id)))
    }

    /// Drive one fetch to resolution. The caller owns the gate for `id`.
    fn fault_in(
        &self,
        id: ObjectId,
        gate: Arc<LookupGate>,
        cx: &mut LookupContext,
        parent: Option<ObjectId>,
        quiet: bool,
    ) -> Result<PeerRef, FaultError> {
        match self.fault_in_inner(id, &gate, cx, parent) {
            Ok(peer_ref) => Ok(peer_ref),
            Err(err) => {
                // Typed failures pass through; everything else is wrapped so
                // callers can still tell not-found and type trouble apart
                // from the rest.
                let err = if err.is_typed() {
                    err
                } else {
                    FaultError::lookup_failed(format!("lookup of {} failed: {}", id, err))
                };
                let mut st = self.lock();
                st.pipeline.finish_lookup(id);
                if !matches!(err, FaultError::ObjectNotFound(_)) {
                    let action = st.pipeline.removed(id, &self.config.fetch);
                    self.apply_flush_action(action);
                }
                st.gates.remove(&id);
                gate.set_failed(err.clone());
                self.shared.cond.notify_all();
                drop(st);
                if !quiet {
                    warn!("Lookup of {} failed: {}", id, err);
                }
                Err(err)
            }
        }
    }

    fn fault_in_inner(
        &self,
        id: ObjectId,
        gate: &LookupGate,
        cx: &mut LookupContext,
        parent: Option<ObjectId>,
    ) -> Result<PeerRef, FaultError> {
        let dna = self.retrieve(id, parent)?;
        assert!(!dna.is_delta, "whole-object record expected for {}", id);
        let peer = self.peer_factory.create_peer(&dna)?;
        let handle = ManagedHandle::new(id, &peer, dna.version, false);
        {
            let st = self.lock();
            gate.set_create(Arc::clone(&handle));
            self.shared.cond.notify_all();
            drop(st);
        }
        // Hydration runs outside the core lock so the references it resolves
        // can take it.
        {
            let resolver = GraphResolver::new(self, cx, id);
            peer.hydrate(&dna, &resolver)?;
        }
        let mut st = self.lock();
        st.gates.remove(&id);
        gate.set_resolved();
        st.identity.put(Arc::clone(&handle));
        self.policy.notify_added(&handle);
        self.shared.cond.notify_all();
        drop(st);
        Ok(PeerRef::new(peer, handle, self.reap_tx.clone()))
    }

    /// Block until the DNA for `id` is available, issuing the fetch when the
    /// manager is running and none is outstanding.
    fn retrieve(&self, id: ObjectId, parent: Option<ObjectId>) -> Result<Dna, FaultError> {
        let depth = self.config.default_fetch_depth as i32;
        let poll = Duration::from_millis(self.config.fetch.retrieve_poll_ms);
        let start = Instant::now();
        let mut warned = false;
        let mut st = self.lock();
        loop {
            if st.run_state == RunState::Stopped {
                return Err(FaultError::ShuttingDown);
            }
            if let Some(dna) = st.pipeline.take_dna(id) {
                st.pipeline.finish_lookup(id);
                return Ok(dna);
            }
            if st.pipeline.is_missing(id) {
                st.pipeline.finish_lookup(id);
                return Err(FaultError::ObjectNotFound(id));
            }
            if st.run_state == RunState::Running && !st.pipeline.has_state(id) {
                let action = st.pipeline.begin_lookup(
                    id,
                    depth,
                    parent,
                    false,
                    &self.config.fetch,
                    &*self.transport,
                );
                self.apply_flush_action(action);
            }
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(st, poll)
                .expect("core lock poisoned");
            st = guard;
            if !warned && start.elapsed() >= poll {
                warned = true;
                warn!(
                    "Still waiting for server response for {} after {:?}",
                    id,
                    start.elapsed()
                );
            }
        }
    }

    // --- updates and commit notifications --------------------------------

    /// Apply a broadcast DNA update to a locally held object. Stale versions
    /// are rejected unless `force` is set; updates for objects not held
    /// locally are dropped. Returns whether the update was applied.
    pub fn apply_update(&self, dna: &Dna, force: bool) -> Result<bool, FaultError> {
        let handle = {
            let st = self.lock();
            st.identity.get(dna.object_id).cloned()
        };
        let Some(handle) = handle else {
            debug!("Dropping update for unregistered {}", dna.object_id);
            return Ok(false);
        };
        let mut cx = LookupContext::new();
        self.begin_operation(&mut cx);
        let result = {
            let resolver = GraphResolver::new(self, &mut cx, dna.object_id);
            handle.apply_dna(dna, force, &resolver)
        };
        self.end_operation(&mut cx);
        result
    }

    /// The transaction that created `id` has committed; the handle becomes
    /// eligible for eviction.
    pub fn notify_committed(&self, id: ObjectId) {
        let st = self.lock();
        if let Some(handle) = st.identity.get(id) {
            handle.mark_committed();
        }
    }

    // --- roots -----------------------------------------------------------

    /// Resolve the root `name`, faulting in its object. `Ok(None)` means the
    /// root does not exist remotely.
    pub fn lookup_root(&self, name: &str) -> Result<Option<PeerRef>, FaultError> {
        match self.retrieve_root_id(name)? {
            Some(id) => self.lookup(id).map(Some),
            None => Ok(None),
        }
    }

    /// Resolve the root `name`, creating it locally exactly once if it does
    /// not exist remotely. Concurrent creators of the same name serialize;
    /// later callers observe the first creator's binding.
    pub fn lookup_or_create_root<F>(
        &self,
        name: &str,
        finalized: bool,
        id_provider: &dyn ObjectIdProvider,
        make_peer: F,
    ) -> Result<PeerRef, FaultError>
    where
        F: FnOnce() -> Arc<dyn ManagedPeer>,
    {
        let mut st = self.lock();
        while st.root_lookups.contains(name) {
            if st.run_state == RunState::Stopped {
                return Err(FaultError::ShuttingDown);
            }
            st = self.wait_bounded(st);
        }
        st.root_lookups.insert(name.to_string());
        drop(st);

        let result = self.create_root_guarded(name, finalized, id_provider, make_peer);

        let mut st = self.lock();
        st.root_lookups.remove(name);
        self.shared.cond.notify_all();
        drop(st);
        result
    }

    fn create_root_guarded<F>(
        &self,
        name: &str,
        finalized: bool,
        id_provider: &dyn ObjectIdProvider,
        make_peer: F,
    ) -> Result<PeerRef, FaultError>
    where
        F: FnOnce() -> Arc<dyn ManagedPeer>,
    {
        if let Some(id) = self.retrieve_root_id(name)? {
            if finalized {
                let mut st = self.lock();
                if let Some(binding) = st.roots.get_mut(name) {
                    binding.finalized = true;
                }
            }
            return self.lookup(id);
        }
        let id = id_provider.next_object_id();
        assert_eq!(
            id.group(),
            self.config.group,
            "root id {} from wrong group",
            id
        );
        let peer = make_peer();
        let handle = ManagedHandle::new(id, &peer, 0, true);
        let mut st = self.lock();
        st.identity.put(Arc::clone(&handle));
        st.roots.insert(name.to_string(), RootBinding { id, finalized });
        self.policy.notify_added(&handle);
        self.shared.cond.notify_all();
        drop(st);
        Ok(PeerRef::new(peer, handle, self.reap_tx.clone()))
    }

    /// Rebind `name` to a new id, e.g. when a replacement root is committed
    /// elsewhere in the cluster. Finalized roots never move; the existing id
    /// is returned unchanged.
    pub fn replace_root_id(&self, name: &str, id: ObjectId) -> ObjectId {
        let mut st = self.lock();
        match st.roots.get_mut(name) {
            Some(binding) if binding.finalized => {
                warn!("Ignoring replacement of finalized root '{}'", name);
                binding.id
            }
            Some(binding) => {
                binding.id = id;
                id
            }
            None => {
                st.roots.insert(
                    name.to_string(),
                    RootBinding {
                        id,
                        finalized: false,
                    },
                );
                id
            }
        }
    }

    fn retrieve_root_id(&self, name: &str) -> Result<Option<ObjectId>, FaultError> {
        let mut st = self.lock();
        loop {
            if st.run_state == RunState::Stopped {
                return Err(FaultError::ShuttingDown);
            }
            if let Some(binding) = st.roots.get(name) {
                return Ok(Some(binding.id));
            }
            match st.root_requests.get(name) {
                Some(Some(id)) => {
                    let id = *id;
                    st.root_requests.remove(name);
                    if id.is_null() {
                        return Ok(None);
                    }
                    st.roots.insert(
                        name.to_string(),
                        RootBinding {
                            id,
                            finalized: false,
                        },
                    );
                    return Ok(Some(id));
                }
                Some(None) => {
                    st = self.wait_bounded(st);
                }
                None => {
                    if st.run_state == RunState::Running {
                        st.root_requests.insert(name.to_string(), None);
                        self.transport.request_root(name);
                    }
                    st = self.wait_bounded(st);
                }
            }
        }
    }

    // --- eviction --------------------------------------------------------

    /// Clear up to `to_clear` references across eviction candidates,
    /// processing them in commit-sized batches. Returns how many references
    /// were actually cleared, which may be less when the population cannot
    /// supply them.
    pub fn evict_references(&self, to_clear: usize) -> usize {
        let commit = self.config.eviction.commit_size;
        let mut cleared = 0;
        while cleared < to_clear {
            let batch = self.policy.removal_candidates(commit);
            if batch.is_empty() {
                break;
            }
            let before = cleared;
            for handle in batch {
                if !handle.try_claim_eviction() {
                    continue;
                }
                let n = handle.clear_references(to_clear - cleared);
                handle.finish_eviction();
                cleared += n;
                if cleared >= to_clear {
                    break;
                }
            }
            if cleared == before {
                break;
            }
        }
        debug!(
            "eviction pass cleared {} of {} requested references",
            cleared, to_clear
        );
        cleared
    }

    // --- lifecycle -------------------------------------------------------

    /// The connection went down. Unconsumed results and removal accounting
    /// are discarded; in-flight lookups park until resume.
    pub fn pause(&self) {
        let mut st = self.lock();
        assert_ne!(st.run_state, RunState::Stopped, "pause after shutdown");
        st.run_state = RunState::Paused;
        self.sessions.new_session();
        st.pipeline.clear_for_pause();
        self.shared.cond.notify_all();
    }

    /// Begin the reconnect handshake, announcing every id still held.
    pub fn initialize_handshake(&self) {
        let mut st = self.lock();
        assert_eq!(st.run_state, RunState::Paused, "handshake outside pause");
        st.run_state = RunState::Starting;
        self.transport.handshake(st.identity.registered_ids());
    }

    /// Handshake acknowledged; re-issue every surviving request and resume.
    pub fn unpause(&self) {
        let mut st = self.lock();
        assert_eq!(st.run_state, RunState::Starting, "unpause before handshake");
        st.run_state = RunState::Running;
        st.pipeline.request_outstanding(&*self.transport);
        let pending_roots: Vec<String> = st
            .root_requests
            .iter()
            .filter(|(_, answer)| answer.is_none())
            .map(|(name, _)| name.clone())
            .collect();
        for name in pending_roots {
            self.transport.request_root(&name);
        }
        self.shared.cond.notify_all();
    }

    pub fn shutdown(&self) {
        let mut st = self.lock();
        st.run_state = RunState::Stopped;
        self.shared.cond.notify_all();
    }

    pub fn run_state(&self) -> RunState {
        self.lock().run_state
    }

    pub fn local_object_count(&self) -> usize {
        self.lock().identity.len()
    }

    /// Parked-result hit and miss counts for the fault-in path.
    pub fn fetch_cache_stats(&self) -> (u64, u64) {
        let st = self.lock();
        (st.pipeline.cache_hits(), st.pipeline.cache_misses())
    }

    // --- inbound events --------------------------------------------------

    pub(crate) fn handle_objects(&self, session: SessionId, batch: BatchId, dnas: Vec<Dna>) {
        if !self.sessions.is_current(session) {
            warn!("Discarding object batch {} from stale session {}", batch, session);
            return;
        }
        let mut st = self.lock();
        if st.run_state == RunState::Stopped {
            return;
        }
        let action = st.pipeline.add_batch(batch, dnas, &self.config.fetch);
        self.apply_flush_action(action);
        self.shared.cond.notify_all();
    }

    pub(crate) fn handle_objects_not_found(&self, session: SessionId, missing: BTreeSet<ObjectId>) {
        if !self.sessions.is_current(session) {
            warn!("Discarding not-found response from stale session {}", session);
            return;
        }
        let mut st = self.lock();
        st.pipeline.objects_not_found(&missing);
        self.shared.cond.notify_all();
    }

    pub(crate) fn handle_root(&self, session: SessionId, name: &str, id: ObjectId) {
        if !self.sessions.is_current(session) {
            warn!(
                "Discarding root response for '{}' from stale session {}",
                name, session
            );
            return;
        }
        let mut st = self.lock();
        match st.root_requests.get_mut(name) {
            Some(answer) => {
                *answer = Some(id);
                self.shared.cond.notify_all();
            }
            None => debug!("Unsolicited root response for '{}'", name),
        }
    }

    /// Reaper callback: remove the identity entry for `id` if its peer is
    /// really gone. The double check matters because a fresh lookup may have
    /// handed out a new strong reference since the drop that queued us.
    pub(crate) fn reap(&self, id: ObjectId) {
        let mut st = self.lock();
        let unreachable = st.identity.get(id).map_or(false, |h| h.peer().is_none());
        if unreachable {
            st.identity.remove(id);
            self.policy.notify_removed(id);
            let action = st.pipeline.removed(id, &self.config.fetch);
            self.apply_flush_action(action);
            self.shared.cond.notify_all();
        }
    }

    // --- timer callbacks -------------------------------------------------

    /// Map a pipeline flush decision onto the shared timer. Scheduling is a
    /// channel send, so this is safe to call while holding the core lock.
    fn apply_flush_action(&self, action: Option<FlushAction>) {
        let Some(action) = action else { return };
        let weak = self.weak_self.clone();
        match action {
            FlushAction::ScheduleLookupFlush => {
                let delay = Duration::from_millis(self.config.fetch.batch_lookup_flush_ms);
                self.timer.schedule_once(delay, move || {
                    if let Some(mgr) = weak.upgrade() {
                        mgr.flush_pending_lookups();
                    }
                });
            }
            FlushAction::ScheduleRemovedNow => {
                self.timer.schedule_once(Duration::ZERO, move || {
                    if let Some(mgr) = weak.upgrade() {
                        mgr.flush_removed();
                    }
                });
            }
            FlushAction::ScheduleRemovedLater => {
                let delay = Duration::from_millis(self.config.fetch.removed_objects_flush_ms);
                self.timer.schedule_once(delay, move || {
                    if let Some(mgr) = weak.upgrade() {
                        mgr.flush_removed();
                    }
                });
            }
        }
    }

    fn flush_pending_lookups(&self) {
        let mut st = self.lock();
        if st.run_state != RunState::Running {
            return;
        }
        st.pipeline.flush_pending(&*self.transport);
    }

    fn flush_removed(&self) {
        let mut st = self.lock();
        if st.run_state != RunState::Running {
            return;
        }
        st.pipeline.flush_removed(&*self.transport);
    }

    fn sweep_unused_batches(&self) {
        let mut st = self.lock();
        if st.run_state != RunState::Running {
            return;
        }
        let action = st.pipeline.sweep_unused_batches(&self.config.fetch);
        self.apply_flush_action(action);
    }
}

/// Resolver handed to hydration: routes child references back into the
/// coordinator carrying the caller's lookup context, which is what lets one
/// logical operation fault in a whole graph without deadlocking on itself.
struct GraphResolver<'a> {
    manager: &'a ClientObjectManager,
    cx: RefCell<&'a mut LookupContext>,
    parent: ObjectId,
}

impl<'a> GraphResolver<'a> {
    fn new(manager: &'a ClientObjectManager, cx: &'a mut LookupContext, parent: ObjectId) -> Self {
        GraphResolver {
            manager,
            cx: RefCell::new(cx),
            parent,
        }
    }
}

impl ReferenceResolver for GraphResolver<'_> {
    fn resolve(&self, id: ObjectId) -> Result<PeerRef, FaultError> {
        let mut guard = self.cx.borrow_mut();
        self.manager
            .lookup_with_context(id, &mut **guard, Some(self.parent), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::eviction::{ClockEvictionPolicy, NoEvictionPolicy};
    use crate::cache::identity::handle::test_support::TestPeer;
    use crate::cache::remote::messages::test_support::RecordingStore;
    use crate::cache::types::DnaValue;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::thread;

    struct CountingTxn {
        suspends: AtomicU64,
        resumes: AtomicU64,
    }

    impl TransactionObserver for CountingTxn {
        fn suspend_logging(&self) {
            self.suspends.fetch_add(1, Ordering::SeqCst);
        }

        fn resume_logging(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TestFactory;

    impl PeerFactory for TestFactory {
        fn create_peer(&self, _dna: &Dna) -> Result<Arc<dyn ManagedPeer>, FaultError> {
            Ok(TestPeer::empty())
        }
    }

    struct FailingFactory;

    impl PeerFactory for FailingFactory {
        fn create_peer(&self, dna: &Dna) -> Result<Arc<dyn ManagedPeer>, FaultError> {
            Err(FaultError::type_resolution(dna.type_name.clone()))
        }
    }

    struct Fixture {
        mgr: Arc<ClientObjectManager>,
        store: Arc<RecordingStore>,
        sessions: Arc<SessionManager>,
        txn: Arc<CountingTxn>,
        _timer: Arc<TaskTimer>,
        _reap_rx: crossbeam_channel::Receiver<ObjectId>,
    }

    impl Fixture {
        fn new(config: FaultlineConfig) -> Self {
            Self::with_parts(config, Arc::new(TestFactory), Arc::new(NoEvictionPolicy))
        }

        fn with_parts(
            config: FaultlineConfig,
            factory: Arc<dyn PeerFactory>,
            policy: Arc<dyn EvictionPolicy>,
        ) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let store = RecordingStore::new();
            let sessions = Arc::new(SessionManager::new());
            let timer = Arc::new(TaskTimer::new("coordinator-test"));
            let txn = Arc::new(CountingTxn {
                suspends: AtomicU64::new(0),
                resumes: AtomicU64::new(0),
            });
            let (reap_tx, reap_rx) = crossbeam_channel::unbounded();
            let mgr = ClientObjectManager::new(
                config,
                store.clone() as Arc<dyn RemoteStore>,
                factory,
                txn.clone() as Arc<dyn TransactionObserver>,
                policy,
                Arc::clone(&sessions),
                Arc::clone(&timer),
                reap_tx,
            );
            Fixture {
                mgr,
                store,
                sessions,
                txn,
                _timer: timer,
                _reap_rx: reap_rx,
            }
        }

        fn wait_for_requests(&self, n: usize) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.store.object_request_count() < n {
                assert!(Instant::now() < deadline, "no request after 5s");
                thread::sleep(Duration::from_millis(2));
            }
        }

        fn deliver(&self, batch: u64, dnas: Vec<Dna>) {
            self.mgr
                .handle_objects(self.sessions.current(), BatchId(batch), dnas);
        }

        /// Answers every object request from `dnas`; ids absent there are
        /// reported not found.
        fn spawn_responder(
            &self,
            dnas: HashMap<ObjectId, Dna>,
            stop: Arc<AtomicBool>,
        ) -> thread::JoinHandle<()> {
            let mgr = Arc::downgrade(&self.mgr);
            let store = Arc::clone(&self.store);
            let sessions = Arc::clone(&self.sessions);
            thread::spawn(move || {
                let mut served = 0;
                let mut batch = 0u64;
                while !stop.load(Ordering::SeqCst) {
                    let requests = store.object_requests.lock().unwrap().clone();
                    while served < requests.len() {
                        let request = &requests[served];
                        served += 1;
                        let mut found = Vec::new();
                        let mut missing = BTreeSet::new();
                        for id in &request.object_ids {
                            match dnas.get(id) {
                                Some(dna) => found.push(dna.clone()),
                                None => {
                                    missing.insert(*id);
                                }
                            }
                        }
                        let Some(mgr) = mgr.upgrade() else { return };
                        if !found.is_empty() {
                            batch += 1;
                            mgr.handle_objects(sessions.current(), BatchId(batch), found);
                        }
                        if !missing.is_empty() {
                            mgr.handle_objects_not_found(sessions.current(), missing);
                        }
                    }
                    thread::sleep(Duration::from_millis(2));
                }
            })
        }
    }

    fn leaf(seq: i64, version: i64) -> Dna {
        Dna::new(ObjectId::new(0, seq), version, "demo.Leaf")
            .with_field("n", DnaValue::Int(version))
    }

    fn node(seq: i64, children: &[i64]) -> Dna {
        let mut dna = Dna::new(ObjectId::new(0, seq), 1, "demo.Node");
        for child in children {
            dna = dna.with_field(
                format!("c{}", child),
                DnaValue::Reference(ObjectId::new(0, *child)),
            );
        }
        dna
    }

    #[test]
    fn local_id_provider_yields_distinct_ids_in_its_group() {
        let provider = LocalObjectIdProvider::new(3);
        let a = provider.next_object_id();
        let b = provider.next_object_id();
        assert_eq!(a.group(), 3);
        assert_eq!(b.group(), 3);
        assert_ne!(a, b);
        assert_eq!(b.sequence(), a.sequence() + 1);
    }

    #[test]
    fn concurrent_callers_share_one_fetch_and_one_handle() {
        let f = Fixture::new(FaultlineConfig::default());
        let id = ObjectId::new(0, 7);

        let mut callers = Vec::new();
        for _ in 0..4 {
            let mgr = Arc::clone(&f.mgr);
            callers.push(thread::spawn(move || mgr.lookup(id).unwrap()));
        }
        f.wait_for_requests(1);
        thread::sleep(Duration::from_millis(30));
        // Still exactly one outstanding request for the id.
        assert_eq!(f.store.object_request_count(), 1);

        f.deliver(1, vec![leaf(7, 1)]);
        let refs: Vec<PeerRef> = callers.into_iter().map(|c| c.join().unwrap()).collect();
        let first = Arc::as_ptr(refs[0].handle());
        for peer_ref in &refs {
            assert_eq!(Arc::as_ptr(peer_ref.handle()), first);
        }
        assert_eq!(f.store.object_request_count(), 1);
        assert_eq!(f.mgr.local_object_count(), 1);
    }

    #[test]
    fn resolved_objects_are_served_from_the_identity_map() {
        let f = Fixture::new(FaultlineConfig::default());
        let id = ObjectId::new(0, 3);
        let mgr = Arc::clone(&f.mgr);
        let caller = thread::spawn(move || mgr.lookup(id).unwrap());
        f.wait_for_requests(1);
        f.deliver(1, vec![leaf(3, 1)]);
        let first = caller.join().unwrap();

        let second = f.mgr.lookup(id).unwrap();
        assert_eq!(Arc::as_ptr(first.handle()), Arc::as_ptr(second.handle()));
        assert_eq!(f.store.object_request_count(), 1);
    }

    #[test]
    fn not_found_surfaces_as_typed_failure() {
        let f = Fixture::new(FaultlineConfig::default());
        let id = ObjectId::new(0, 42);
        let mgr = Arc::clone(&f.mgr);
        let caller = thread::spawn(move || mgr.lookup_quiet(id));
        f.wait_for_requests(1);
        let missing: BTreeSet<_> = [id].into_iter().collect();
        f.mgr.handle_objects_not_found(f.sessions.current(), missing);
        let err = caller.join().unwrap().unwrap_err();
        assert_eq!(err, FaultError::ObjectNotFound(id));
        assert_eq!(f.mgr.local_object_count(), 0);
    }

    #[test]
    fn stale_session_response_resolves_nothing() {
        let f = Fixture::new(FaultlineConfig::default());
        let id = ObjectId::new(0, 5);
        let mgr = Arc::clone(&f.mgr);
        let caller = thread::spawn(move || mgr.lookup(id).unwrap());
        f.wait_for_requests(1);

        let stale = SessionId(f.sessions.current().0 + 1);
        f.mgr.handle_objects(stale, BatchId(1), vec![leaf(5, 1)]);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(f.mgr.local_object_count(), 0);

        f.deliver(2, vec![leaf(5, 1)]);
        caller.join().unwrap();
        assert_eq!(f.mgr.local_object_count(), 1);
    }

    #[test]
    fn factory_failure_releases_all_waiters_typed() {
        let f = Fixture::with_parts(
            FaultlineConfig::default(),
            Arc::new(FailingFactory),
            Arc::new(NoEvictionPolicy),
        );
        let id = ObjectId::new(0, 8);
        let mgr_a = Arc::clone(&f.mgr);
        let a = thread::spawn(move || mgr_a.lookup_quiet(id));
        f.wait_for_requests(1);
        let mgr_b = Arc::clone(&f.mgr);
        let b = thread::spawn(move || mgr_b.lookup_quiet(id));
        thread::sleep(Duration::from_millis(30));

        f.deliver(1, vec![leaf(8, 1)]);
        assert!(matches!(
            a.join().unwrap(),
            Err(FaultError::TypeResolution(_))
        ));
        assert!(matches!(
            b.join().unwrap(),
            Err(FaultError::TypeResolution(_))
        ));
        assert_eq!(f.mgr.local_object_count(), 0);
    }

    #[test]
    fn graph_hydration_faults_children_within_one_operation() {
        let f = Fixture::new(FaultlineConfig::default());
        let dnas: HashMap<_, _> = [node(1, &[2, 3]), leaf(2, 1), leaf(3, 1)]
            .into_iter()
            .map(|d| (d.object_id, d))
            .collect();
        let stop = Arc::new(AtomicBool::new(false));
        let responder = f.spawn_responder(dnas, Arc::clone(&stop));

        let root = f.mgr.lookup(ObjectId::new(0, 1)).unwrap();
        assert_eq!(f.mgr.local_object_count(), 3);
        assert_eq!(root.peer().clear_references(usize::MAX), 2);
        // One logical operation: logging suspended and resumed exactly once.
        assert_eq!(f.txn.suspends.load(Ordering::SeqCst), 1);
        assert_eq!(f.txn.resumes.load(Ordering::SeqCst), 1);

        stop.store(true, Ordering::SeqCst);
        responder.join().unwrap();
    }

    #[test]
    fn cyclic_references_resolve_without_deadlock() {
        let f = Fixture::new(FaultlineConfig::default());
        let dnas: HashMap<_, _> = [node(1, &[2]), node(2, &[1])]
            .into_iter()
            .map(|d| (d.object_id, d))
            .collect();
        let stop = Arc::new(AtomicBool::new(false));
        let responder = f.spawn_responder(dnas, Arc::clone(&stop));

        let a = f.mgr.lookup(ObjectId::new(0, 1)).unwrap();
        assert_eq!(f.mgr.local_object_count(), 2);
        assert_eq!(a.peer().clear_references(usize::MAX), 1);

        stop.store(true, Ordering::SeqCst);
        responder.join().unwrap();
    }

    #[test]
    fn pause_discards_state_and_unpause_replays_requests() {
        let f = Fixture::new(FaultlineConfig::default());
        let id = ObjectId::new(0, 6);
        let mgr = Arc::clone(&f.mgr);
        let caller = thread::spawn(move || mgr.lookup(id).unwrap());
        f.wait_for_requests(1);

        f.mgr.pause();
        assert_eq!(f.mgr.run_state(), RunState::Paused);
        f.mgr.initialize_handshake();
        assert_eq!(f.store.handshakes.lock().unwrap().len(), 1);
        f.mgr.unpause();
        assert_eq!(f.mgr.run_state(), RunState::Running);

        // The surviving lookup was re-issued under the new session.
        f.wait_for_requests(2);
        f.deliver(1, vec![leaf(6, 1)]);
        caller.join().unwrap();
        assert_eq!(f.mgr.local_object_count(), 1);
    }

    #[test]
    fn prefetched_result_serves_later_lookup_without_refetch() {
        let f = Fixture::new(FaultlineConfig::default());
        let id = ObjectId::new(0, 9);
        f.mgr.prefetch(id);
        f.wait_for_requests(1);
        f.deliver(1, vec![leaf(9, 2)]);
        thread::sleep(Duration::from_millis(20));

        let peer_ref = f.mgr.lookup(id).unwrap();
        assert_eq!(peer_ref.handle().version(), 2);
        assert_eq!(f.store.object_request_count(), 1);
        // One miss for the prefetch itself, one hit for the consuming lookup.
        assert_eq!(f.mgr.fetch_cache_stats(), (1, 1));
    }

    #[test]
    fn prefetch_not_found_is_silently_discarded() {
        let f = Fixture::new(FaultlineConfig::default());
        let id = ObjectId::new(0, 77);
        f.mgr.prefetch(id);
        f.wait_for_requests(1);
        let missing: BTreeSet<_> = [id].into_iter().collect();
        f.mgr.handle_objects_not_found(f.sessions.current(), missing);
        thread::sleep(Duration::from_millis(20));
        assert!(f.mgr.lookup_if_local(id).is_none());
    }

    #[test]
    fn stale_update_rejected_newer_applied() {
        let f = Fixture::new(FaultlineConfig::default());
        let id = ObjectId::new(0, 4);
        let mgr = Arc::clone(&f.mgr);
        let caller = thread::spawn(move || mgr.lookup(id).unwrap());
        f.wait_for_requests(1);
        f.deliver(1, vec![leaf(4, 5)]);
        let peer_ref = caller.join().unwrap();
        assert_eq!(peer_ref.handle().version(), 5);

        assert!(!f.mgr.apply_update(&leaf(4, 5), false).unwrap());
        assert!(!f.mgr.apply_update(&leaf(4, 3), false).unwrap());
        assert!(f.mgr.apply_update(&leaf(4, 6), false).unwrap());
        assert_eq!(peer_ref.handle().version(), 6);
        assert!(f.mgr.apply_update(&leaf(4, 2), true).unwrap());
        assert_eq!(peer_ref.handle().version(), 2);
    }

    #[test]
    fn reap_removes_only_unreachable_entries() {
        let f = Fixture::new(FaultlineConfig::default());
        let id = ObjectId::new(0, 11);
        let mgr = Arc::clone(&f.mgr);
        let caller = thread::spawn(move || mgr.lookup(id).unwrap());
        f.wait_for_requests(1);
        f.deliver(1, vec![leaf(11, 1)]);
        let peer_ref = caller.join().unwrap();

        // Still reachable: reap is a no-op.
        f.mgr.reap(id);
        assert_eq!(f.mgr.local_object_count(), 1);

        drop(peer_ref);
        f.mgr.reap(id);
        assert_eq!(f.mgr.local_object_count(), 0);
    }

    #[test]
    fn eviction_clears_only_what_the_population_supplies() {
        let f = Fixture::with_parts(
            FaultlineConfig::default(),
            Arc::new(TestFactory),
            Arc::new(ClockEvictionPolicy::new()),
        );
        let dnas: HashMap<_, _> = [node(1, &[2, 3, 4]), leaf(2, 1), leaf(3, 1), leaf(4, 1)]
            .into_iter()
            .map(|d| (d.object_id, d))
            .collect();
        let stop = Arc::new(AtomicBool::new(false));
        let responder = f.spawn_responder(dnas, Arc::clone(&stop));
        let root = f.mgr.lookup(ObjectId::new(0, 1)).unwrap();
        stop.store(true, Ordering::SeqCst);
        responder.join().unwrap();

        // The graph holds exactly three references; asking for ten clears
        // three and terminates.
        assert_eq!(f.mgr.evict_references(10), 3);
        assert_eq!(f.mgr.evict_references(10), 0);
        drop(root);
    }

    #[test]
    fn root_created_exactly_once_across_concurrent_callers() {
        let f = Fixture::new(FaultlineConfig::default());

        // The remote store has no such root; answer every root request with
        // the null id.
        let mgr_weak = Arc::downgrade(&f.mgr);
        let store = Arc::clone(&f.store);
        let sessions = Arc::clone(&f.sessions);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let responder = thread::spawn(move || {
            let mut served = 0;
            while !stop_flag.load(Ordering::SeqCst) {
                let names = store.root_requests.lock().unwrap().clone();
                while served < names.len() {
                    let name = names[served].clone();
                    served += 1;
                    if let Some(mgr) = mgr_weak.upgrade() {
                        mgr.handle_root(sessions.current(), &name, ObjectId::NULL);
                    }
                }
                thread::sleep(Duration::from_millis(2));
            }
        });

        let ids = Arc::new(LocalObjectIdProvider::new(0));
        let mut creators = Vec::new();
        for _ in 0..2 {
            let mgr = Arc::clone(&f.mgr);
            let ids = Arc::clone(&ids);
            creators.push(thread::spawn(move || {
                mgr.lookup_or_create_root("sessions", false, &*ids, TestPeer::empty)
                    .unwrap()
            }));
        }
        let created: Vec<PeerRef> = creators.into_iter().map(|c| c.join().unwrap()).collect();
        assert_eq!(created[0].object_id(), created[1].object_id());
        assert_eq!(f.mgr.local_object_count(), 1);

        // A later plain lookup observes the same binding without any fetch.
        let looked_up = f.mgr.lookup_root("sessions").unwrap().unwrap();
        assert_eq!(looked_up.object_id(), created[0].object_id());

        stop.store(true, Ordering::SeqCst);
        responder.join().unwrap();
    }

    #[test]
    fn finalized_root_never_moves() {
        let f = Fixture::new(FaultlineConfig::default());
        let mgr = Arc::clone(&f.mgr);
        let creator = thread::spawn(move || {
            let ids = LocalObjectIdProvider::new(0);
            mgr.lookup_or_create_root("config", true, &ids, TestPeer::empty)
                .unwrap()
        });
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.store.root_requests.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "no root request after 5s");
            thread::sleep(Duration::from_millis(2));
        }
        f.mgr.handle_root(f.sessions.current(), "config", ObjectId::NULL);
        let root = creator.join().unwrap();

        let replacement = ObjectId::new(0, 999);
        assert_eq!(f.mgr.replace_root_id("config", replacement), root.object_id());
    }

    #[test]
    #[should_panic(expected = "outside group")]
    fn wrong_group_lookup_is_fatal() {
        let f = Fixture::new(FaultlineConfig::default());
        let _ = f.mgr.lookup(ObjectId::new(3, 1));
    }

    #[test]
    fn shutdown_fails_new_lookups() {
        let f = Fixture::new(FaultlineConfig::default());
        f.mgr.shutdown();
        let err = f.mgr.lookup_quiet(ObjectId::new(0, 1)).unwrap_err();
        assert_eq!(err, FaultError::ShuttingDown);
    }
}
