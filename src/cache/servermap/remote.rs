//! Remote request manager for server maps.
//!
//! Built on the same request/response and batching idioms as the object
//! fetch pipeline, with one deliberate asymmetry: only GET_VALUE requests
//! coalesce. Size and key enumeration always go out immediately, they have
//! no useful coalescing opportunity.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::cache::config::ServerMapConfig;
use crate::cache::remote::{RemoteStore, ServerMapRequest, SessionManager, ValueRequest};
use crate::cache::types::{FaultError, MapValue, ObjectId, RequestId, RunState, SessionId};
use crate::cache::worker::TaskTimer;

enum SmKind {
    GetValue {
        map_id: ObjectId,
        keys: BTreeSet<String>,
    },
    GetSize {
        map_ids: Vec<ObjectId>,
    },
    GetAllKeys {
        map_id: ObjectId,
    },
}

enum SmResult {
    Values(HashMap<String, MapValue>),
    Size(u64),
    Keys(BTreeSet<String>),
}

struct SmEntry {
    kind: SmKind,
    /// Awaiting the coalescing flush; only ever true for GET_VALUE.
    pending: bool,
    result: Option<Result<SmResult, FaultError>>,
}

struct SmState {
    run_state: RunState,
    outstanding: HashMap<RequestId, SmEntry>,
    flush_scheduled: bool,
    counter: u64,
}

pub struct RemoteServerMapManager {
    state: Mutex<SmState>,
    cond: Condvar,
    transport: Arc<dyn RemoteStore>,
    sessions: Arc<SessionManager>,
    timer: Arc<TaskTimer>,
    config: ServerMapConfig,
    weak_self: Weak<RemoteServerMapManager>,
}

impl RemoteServerMapManager {
    pub fn new(
        config: ServerMapConfig,
        transport: Arc<dyn RemoteStore>,
        sessions: Arc<SessionManager>,
        timer: Arc<TaskTimer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| RemoteServerMapManager {
            state: Mutex::new(SmState {
                run_state: RunState::Running,
                outstanding: HashMap::new(),
                flush_scheduled: false,
                counter: 0,
            }),
            cond: Condvar::new(),
            transport,
            sessions,
            timer,
            config,
            weak_self: weak.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SmState> {
        self.state.lock().expect("server map lock poisoned")
    }

    /// Fetch values for `keys` of one map. Batched: under heavy traffic the
    /// request parks until the coalescing flush.
    pub fn get_values(
        &self,
        map_id: ObjectId,
        keys: BTreeSet<String>,
    ) -> Result<HashMap<String, MapValue>, FaultError> {
        let request_id = {
            let mut st = self.lock();
            st.counter += 1;
            let request_id = RequestId(st.counter);
            let in_flight = st
                .outstanding
                .values()
                .filter(|e| matches!(e.kind, SmKind::GetValue { .. }) && !e.pending)
                .count();
            let send_now = st.run_state == RunState::Running
                && in_flight + 1 <= self.config.max_outstanding_sent_immediately;
            st.outstanding.insert(
                request_id,
                SmEntry {
                    kind: SmKind::GetValue {
                        map_id,
                        keys: keys.clone(),
                    },
                    pending: !send_now,
                    result: None,
                },
            );
            if send_now {
                self.transport
                    .server_map_request(ServerMapRequest::GetValue {
                        requests: vec![ValueRequest {
                            request_id,
                            map_id,
                            keys,
                        }],
                    });
            } else if !st.flush_scheduled && st.run_state == RunState::Running {
                st.flush_scheduled = true;
                let weak = self.weak_self.clone();
                self.timer.schedule_once(
                    Duration::from_millis(self.config.batch_lookup_flush_ms),
                    move || {
                        if let Some(mgr) = weak.upgrade() {
                            mgr.flush_pending();
                        }
                    },
                );
            }
            request_id
        };
        match self.await_result(request_id)? {
            SmResult::Values(values) => Ok(values),
            _ => panic!("value request {} answered with a non-value result", request_id),
        }
    }

    /// Total size across `map_ids`. Never batched.
    pub fn get_size(&self, map_ids: Vec<ObjectId>) -> Result<u64, FaultError> {
        let request_id = {
            let mut st = self.lock();
            st.counter += 1;
            let request_id = RequestId(st.counter);
            st.outstanding.insert(
                request_id,
                SmEntry {
                    kind: SmKind::GetSize {
                        map_ids: map_ids.clone(),
                    },
                    pending: false,
                    result: None,
                },
            );
            self.transport
                .server_map_request(ServerMapRequest::GetSize {
                    request_id,
                    map_ids,
                });
            request_id
        };
        match self.await_result(request_id)? {
            SmResult::Size(size) => Ok(size),
            _ => panic!("size request {} answered with a non-size result", request_id),
        }
    }

    /// All keys of one map. Never batched.
    pub fn get_all_keys(&self, map_id: ObjectId) -> Result<BTreeSet<String>, FaultError> {
        let request_id = {
            let mut st = self.lock();
            st.counter += 1;
            let request_id = RequestId(st.counter);
            st.outstanding.insert(
                request_id,
                SmEntry {
                    kind: SmKind::GetAllKeys { map_id },
                    pending: false,
                    result: None,
                },
            );
            self.transport
                .server_map_request(ServerMapRequest::GetAllKeys { request_id, map_id });
            request_id
        };
        match self.await_result(request_id)? {
            SmResult::Keys(keys) => Ok(keys),
            _ => panic!("keys request {} answered with a non-keys result", request_id),
        }
    }

    fn await_result(&self, request_id: RequestId) -> Result<SmResult, FaultError> {
        let poll = Duration::from_millis(self.config.result_poll_ms);
        let start = Instant::now();
        let mut warned = false;
        let mut st = self.lock();
        loop {
            if st.run_state == RunState::Stopped {
                st.outstanding.remove(&request_id);
                return Err(FaultError::ShuttingDown);
            }
            let entry = st
                .outstanding
                .get_mut(&request_id)
                .expect("waiting on a retired server map request");
            if let Some(result) = entry.result.take() {
                st.outstanding.remove(&request_id);
                return result;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(st, poll)
                .expect("server map lock poisoned");
            st = guard;
            if !warned && start.elapsed() >= poll {
                warned = true;
                warn!(
                    "Still waiting for server map response to request {} after {:?}",
                    request_id,
                    start.elapsed()
                );
            }
        }
    }

    /// Coalesce every parked GET_VALUE into one outbound message.
    fn flush_pending(&self) {
        let mut st = self.lock();
        st.flush_scheduled = false;
        if st.run_state != RunState::Running {
            return;
        }
        let mut requests = Vec::new();
        for (request_id, entry) in st.outstanding.iter_mut() {
            if !entry.pending {
                continue;
            }
            entry.pending = false;
            match &entry.kind {
                SmKind::GetValue { map_id, keys } => requests.push(ValueRequest {
                    request_id: *request_id,
                    map_id: *map_id,
                    keys: keys.clone(),
                }),
                _ => panic!("non-value server map request marked pending"),
            }
        }
        if !requests.is_empty() {
            self.transport
                .server_map_request(ServerMapRequest::GetValue { requests });
        }
    }

    // --- lifecycle -------------------------------------------------------

    pub fn pause(&self) {
        let mut st = self.lock();
        assert_ne!(st.run_state, RunState::Stopped, "pause after shutdown");
        st.run_state = RunState::Paused;
        st.flush_scheduled = false;
        self.cond.notify_all();
    }

    /// Re-issue every unanswered request and resume.
    pub fn unpause(&self) {
        let mut st = self.lock();
        assert_eq!(st.run_state, RunState::Paused, "unpause without pause");
        st.run_state = RunState::Running;
        let mut values = Vec::new();
        for (request_id, entry) in st.outstanding.iter_mut() {
            if entry.result.is_some() {
                continue;
            }
            entry.pending = false;
            match &entry.kind {
                SmKind::GetValue { map_id, keys } => values.push(ValueRequest {
                    request_id: *request_id,
                    map_id: *map_id,
                    keys: keys.clone(),
                }),
                SmKind::GetSize { map_ids } => {
                    self.transport
                        .server_map_request(ServerMapRequest::GetSize {
                            request_id: *request_id,
                            map_ids: map_ids.clone(),
                        });
                }
                SmKind::GetAllKeys { map_id } => {
                    self.transport
                        .server_map_request(ServerMapRequest::GetAllKeys {
                            request_id: *request_id,
                            map_id: *map_id,
                        });
                }
            }
        }
        if !values.is_empty() {
            self.transport
                .server_map_request(ServerMapRequest::GetValue { requests: values });
        }
        self.cond.notify_all();
    }

    pub fn shutdown(&self) {
        let mut st = self.lock();
        st.run_state = RunState::Stopped;
        self.cond.notify_all();
    }

    // --- inbound events --------------------------------------------------

    pub(crate) fn handle_values(
        &self,
        session: SessionId,
        map_id: ObjectId,
        request_id: RequestId,
        values: HashMap<String, MapValue>,
    ) {
        if !self.sessions.is_current(session) {
            warn!(
                "Discarding server map values from stale session {}",
                session
            );
            return;
        }
        let mut st = self.lock();
        match st.outstanding.get_mut(&request_id) {
            Some(entry) => {
                match &entry.kind {
                    SmKind::GetValue {
                        map_id: expected, ..
                    } => assert_eq!(
                        *expected, map_id,
                        "value response for request {} names the wrong map",
                        request_id
                    ),
                    _ => panic!("value response for non-value request {}", request_id),
                }
                entry.result = Some(Ok(SmResult::Values(values)));
                self.cond.notify_all();
            }
            None => debug!("Late server map response for request {}", request_id),
        }
    }

    pub(crate) fn handle_size(&self, session: SessionId, request_id: RequestId, size: u64) {
        if !self.sessions.is_current(session) {
            warn!("Discarding server map size from stale session {}", session);
            return;
        }
        let mut st = self.lock();
        if let Some(entry) = st.outstanding.get_mut(&request_id) {
            entry.result = Some(Ok(SmResult::Size(size)));
            self.cond.notify_all();
        }
    }

    pub(crate) fn handle_keys(
        &self,
        session: SessionId,
        request_id: RequestId,
        keys: BTreeSet<String>,
    ) {
        if !self.sessions.is_current(session) {
            warn!("Discarding server map keys from stale session {}", session);
            return;
        }
        let mut st = self.lock();
        if let Some(entry) = st.outstanding.get_mut(&request_id) {
            entry.result = Some(Ok(SmResult::Keys(keys)));
            self.cond.notify_all();
        }
    }

    pub(crate) fn handle_missing(
        &self,
        session: SessionId,
        request_id: RequestId,
        map_id: ObjectId,
    ) {
        if !self.sessions.is_current(session) {
            warn!(
                "Discarding server map missing-notice from stale session {}",
                session
            );
            return;
        }
        let mut st = self.lock();
        if let Some(entry) = st.outstanding.get_mut(&request_id) {
            entry.result = Some(Err(FaultError::MapNotFound(map_id)));
            self.cond.notify_all();
        }
    }
}
