//! Public facade: build one engine instance and drive it.
//!
//! A [`Faultline`] owns the lookup coordinator, the server-map manager, the
//! shared timer, and the reaper thread. The embedding runtime supplies the
//! transport and peer factory, feeds inbound traffic through
//! [`Faultline::deliver`], and drives pause/handshake/unpause around
//! reconnects.

use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use log::debug;

use crate::cache::config::FaultlineConfig;
use crate::cache::coordinator::{
    ClientObjectManager, LocalObjectIdProvider, NoopTransactionObserver, ObjectIdProvider,
    TransactionObserver,
};
use crate::cache::eviction::{ClockEvictionPolicy, EvictionPolicy};
use crate::cache::identity::reaper::Reaper;
use crate::cache::identity::{ManagedPeer, PeerFactory, PeerRef};
use crate::cache::remote::{RemoteStore, SessionManager, StoreEvent};
use crate::cache::servermap::{RemoteServerMapManager, ServerMap};
use crate::cache::types::{Dna, FaultError, ObjectId, RunState, SessionId};
use crate::cache::worker::TaskTimer;

/// Builder for a [`Faultline`] engine. Transport and peer factory are
/// mandatory; everything else has production defaults.
pub struct FaultlineBuilder {
    config: FaultlineConfig,
    transport: Option<Arc<dyn RemoteStore>>,
    peer_factory: Option<Arc<dyn PeerFactory>>,
    txn: Arc<dyn TransactionObserver>,
    policy: Option<Arc<dyn EvictionPolicy>>,
    id_provider: Option<Arc<dyn ObjectIdProvider>>,
}

impl Default for FaultlineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultlineBuilder {
    pub fn new() -> Self {
        FaultlineBuilder {
            config: FaultlineConfig::default(),
            transport: None,
            peer_factory: None,
            txn: Arc::new(NoopTransactionObserver),
            policy: None,
            id_provider: None,
        }
    }

    pub fn config(mut self, config: FaultlineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn RemoteStore>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn peer_factory(mut self, factory: Arc<dyn PeerFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    pub fn transaction_observer(mut self, txn: Arc<dyn TransactionObserver>) -> Self {
        self.txn = txn;
        self
    }

    pub fn eviction_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn object_id_provider(mut self, provider: Arc<dyn ObjectIdProvider>) -> Self {
        self.id_provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<Faultline, FaultError> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| FaultError::invalid_state("a transport is required"))?;
        let peer_factory = self
            .peer_factory
            .ok_or_else(|| FaultError::invalid_state("a peer factory is required"))?;
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(ClockEvictionPolicy::new()));
        let id_provider = self
            .id_provider
            .unwrap_or_else(|| Arc::new(LocalObjectIdProvider::new(self.config.group)));

        let sessions = Arc::new(SessionManager::new());
        let timer = Arc::new(TaskTimer::new("faultline"));

        // The reaper thread starts before the manager exists; its callback
        // resolves the manager through a slot filled right after.
        let manager_slot: Arc<Mutex<Weak<ClientObjectManager>>> =
            Arc::new(Mutex::new(Weak::new()));
        let callback_slot = Arc::clone(&manager_slot);
        let reaper = Reaper::start(move |id| {
            let target = callback_slot.lock().expect("reaper slot poisoned").upgrade();
            if let Some(manager) = target {
                manager.reap(id);
            }
        });

        let manager = ClientObjectManager::new(
            self.config.clone(),
            Arc::clone(&transport),
            peer_factory,
            self.txn,
            policy,
            Arc::clone(&sessions),
            Arc::clone(&timer),
            reaper.queue(),
        );
        *manager_slot.lock().expect("reaper slot poisoned") = Arc::downgrade(&manager);

        let server_maps = RemoteServerMapManager::new(
            self.config.server_map.clone(),
            transport,
            Arc::clone(&sessions),
            Arc::clone(&timer),
        );

        Ok(Faultline {
            manager,
            server_maps,
            maps: DashMap::new(),
            sessions,
            id_provider,
            config: self.config,
            reaper: Mutex::new(reaper),
            _timer: timer,
        })
    }
}

/// One fault-in engine instance.
pub struct Faultline {
    manager: Arc<ClientObjectManager>,
    server_maps: Arc<RemoteServerMapManager>,
    maps: DashMap<ObjectId, Arc<ServerMap>>,
    sessions: Arc<SessionManager>,
    id_provider: Arc<dyn ObjectIdProvider>,
    config: FaultlineConfig,
    reaper: Mutex<Reaper>,
    _timer: Arc<TaskTimer>,
}

impl Faultline {
    pub fn builder() -> FaultlineBuilder {
        FaultlineBuilder::new()
    }

    // --- objects ---------------------------------------------------------

    pub fn lookup(&self, id: ObjectId) -> Result<PeerRef, FaultError> {
        self.manager.lookup(id)
    }

    pub fn lookup_quiet(&self, id: ObjectId) -> Result<PeerRef, FaultError> {
        self.manager.lookup_quiet(id)
    }

    pub fn lookup_if_local(&self, id: ObjectId) -> Option<PeerRef> {
        self.manager.lookup_if_local(id)
    }

    pub fn prefetch(&self, id: ObjectId) {
        self.manager.prefetch(id)
    }

    pub fn apply_update(&self, dna: &Dna, force: bool) -> Result<bool, FaultError> {
        self.manager.apply_update(dna, force)
    }

    pub fn notify_committed(&self, id: ObjectId) {
        self.manager.notify_committed(id)
    }

    /// Clear up to `references` outgoing references across eviction
    /// candidates; returns how many were cleared.
    pub fn evict(&self, references: usize) -> usize {
        self.manager.evict_references(references)
    }

    pub fn local_object_count(&self) -> usize {
        self.manager.local_object_count()
    }

    // --- roots -----------------------------------------------------------

    pub fn lookup_root(&self, name: &str) -> Result<Option<PeerRef>, FaultError> {
        self.manager.lookup_root(name)
    }

    pub fn lookup_or_create_root<F>(
        &self,
        name: &str,
        finalized: bool,
        make_peer: F,
    ) -> Result<PeerRef, FaultError>
    where
        F: FnOnce() -> Arc<dyn ManagedPeer>,
    {
        self.manager
            .lookup_or_create_root(name, finalized, &*self.id_provider, make_peer)
    }

    pub fn replace_root_id(&self, name: &str, id: ObjectId) -> ObjectId {
        self.manager.replace_root_id(name, id)
    }

    // --- server maps -----------------------------------------------------

    /// Handle for one shared server map, created on first use.
    pub fn server_map(&self, map_id: ObjectId) -> Arc<ServerMap> {
        self.maps
            .entry(map_id)
            .or_insert_with(|| {
                Arc::new(ServerMap::new(
                    map_id,
                    Arc::clone(&self.server_maps),
                    self.config.server_map.clone(),
                ))
            })
            .value()
            .clone()
    }

    // --- lifecycle -------------------------------------------------------

    /// The connection dropped: advance the session and discard in-flight
    /// accounting on both managers.
    pub fn pause(&self) {
        self.manager.pause();
        self.server_maps.pause();
        for map in self.maps.iter() {
            map.clear_local();
        }
    }

    pub fn initialize_handshake(&self) {
        self.manager.initialize_handshake();
    }

    pub fn unpause(&self) {
        self.manager.unpause();
        self.server_maps.unpause();
    }

    pub fn shutdown(&self) {
        self.manager.shutdown();
        self.server_maps.shutdown();
        self.reaper.lock().expect("reaper handle poisoned").shutdown();
    }

    pub fn run_state(&self) -> RunState {
        self.manager.run_state()
    }

    pub fn current_session(&self) -> SessionId {
        self.sessions.current()
    }

    // --- inbound traffic -------------------------------------------------

    /// Route one asynchronous store event to the component that owns it.
    pub fn deliver(&self, event: StoreEvent) {
        match event {
            StoreEvent::Objects {
                session,
                batch,
                dnas,
            } => self.manager.handle_objects(session, batch, dnas),
            StoreEvent::ObjectsNotFound { session, missing } => {
                self.manager.handle_objects_not_found(session, missing)
            }
            StoreEvent::Root {
                session,
                name,
                object_id,
            } => self.manager.handle_root(session, &name, object_id),
            StoreEvent::ServerMapValues {
                session,
                map_id,
                request_id,
                values,
            } => self
                .server_maps
                .handle_values(session, map_id, request_id, values),
            StoreEvent::ServerMapSize {
                session,
                request_id,
                size,
            } => self.server_maps.handle_size(session, request_id, size),
            StoreEvent::ServerMapKeys {
                session,
                request_id,
                keys,
            } => self.server_maps.handle_keys(session, request_id, keys),
            StoreEvent::ServerMapMissing {
                session,
                request_id,
                map_id,
            } => self.server_maps.handle_missing(session, request_id, map_id),
            StoreEvent::Invalidations { map_id, keys } => match self.maps.get(&map_id) {
                Some(map) => map.invalidate_keys(keys),
                None => debug!("Invalidation for untracked map {}", map_id),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::identity::handle::test_support::TestPeer;
    use crate::cache::remote::messages::test_support::RecordingStore;
    use crate::cache::types::{BatchId, DnaValue, MapValue};
    use std::collections::HashMap;
    use std::thread;
    use std::time::{Duration, Instant};

    struct TestFactory;

    impl PeerFactory for TestFactory {
        fn create_peer(&self, _dna: &Dna) -> Result<Arc<dyn ManagedPeer>, FaultError> {
            Ok(TestPeer::empty())
        }
    }

    fn engine() -> (Arc<Faultline>, Arc<RecordingStore>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = RecordingStore::new();
        let engine = Faultline::builder()
            .transport(store.clone() as Arc<dyn RemoteStore>)
            .peer_factory(Arc::new(TestFactory))
            .build()
            .unwrap();
        (Arc::new(engine), store)
    }

    fn wait_until(deadline_ms: u64, mut probe: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while !probe() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn build_requires_transport_and_factory() {
        let err = Faultline::builder().build().err().unwrap();
        assert!(matches!(err, FaultError::InvalidState(_)));
    }

    #[test]
    fn end_to_end_lookup_through_deliver() {
        let (engine, store) = engine();
        let id = ObjectId::new(0, 21);
        let caller = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.lookup(id).unwrap())
        };
        wait_until(5_000, || store.object_request_count() == 1);

        let dna = Dna::new(id, 1, "demo.Leaf").with_field("n", DnaValue::Int(1));
        engine.deliver(StoreEvent::Objects {
            session: engine.current_session(),
            batch: BatchId(1),
            dnas: vec![dna],
        });
        let peer_ref = caller.join().unwrap();
        assert_eq!(peer_ref.object_id(), id);
        assert_eq!(engine.local_object_count(), 1);
    }

    #[test]
    fn server_map_handles_are_shared_per_map() {
        let (engine, _store) = engine();
        let a = engine.server_map(ObjectId::new(0, 1));
        let b = engine.server_map(ObjectId::new(0, 1));
        let c = engine.server_map(ObjectId::new(0, 2));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn invalidations_route_to_the_owning_map() {
        let (engine, store) = engine();
        let map_id = ObjectId::new(0, 5);
        let map = engine.server_map(map_id);

        let reader = {
            let map = Arc::clone(&map);
            thread::spawn(move || map.get_value_eventual("k").unwrap())
        };
        wait_until(5_000, || !store.map_requests.lock().unwrap().is_empty());
        let requests = store.map_requests.lock().unwrap().clone();
        let crate::cache::remote::ServerMapRequest::GetValue { requests: inner } = &requests[0]
        else {
            panic!("expected a value request");
        };
        let mut answer = HashMap::new();
        answer.insert("k".to_string(), MapValue::Literal(DnaValue::Int(1)));
        engine.deliver(StoreEvent::ServerMapValues {
            session: engine.current_session(),
            map_id,
            request_id: inner[0].request_id,
            values: answer,
        });
        assert!(reader.join().unwrap().is_some());
        assert_eq!(map.local_entry_count(), 1);

        engine.deliver(StoreEvent::Invalidations {
            map_id,
            keys: vec!["k".to_string()],
        });
        assert_eq!(map.local_entry_count(), 0);
    }

    #[test]
    fn reaper_retires_dropped_objects() {
        let (engine, store) = engine();
        let id = ObjectId::new(0, 30);
        let caller = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.lookup(id).unwrap())
        };
        wait_until(5_000, || store.object_request_count() == 1);
        engine.deliver(StoreEvent::Objects {
            session: engine.current_session(),
            batch: BatchId(1),
            dnas: vec![Dna::new(id, 1, "demo.Leaf")],
        });
        let peer_ref = caller.join().unwrap();
        assert_eq!(engine.local_object_count(), 1);

        drop(peer_ref);
        wait_until(5_000, || engine.local_object_count() == 0);
    }

    #[test]
    fn pause_clears_server_map_local_state() {
        let (engine, _store) = engine();
        let map = engine.server_map(ObjectId::new(0, 6));
        map.note_put_eventual("k", MapValue::Literal(DnaValue::Int(1)));
        assert_eq!(map.local_entry_count(), 1);

        engine.pause();
        assert_eq!(map.local_entry_count(), 0);
        assert_eq!(engine.run_state(), RunState::Paused);
        engine.initialize_handshake();
        engine.unpause();
        assert_eq!(engine.run_state(), RunState::Running);
    }
}
