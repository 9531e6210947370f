//! Abstract request/response contracts with the remote store.
//!
//! The engine never sees bytes: outbound traffic goes through the
//! [`RemoteStore`] trait and inbound traffic arrives as [`StoreEvent`]
//! values routed by the owning runtime. Wire framing, serialization and
//! connection management are the transport's problem.

use std::collections::{BTreeSet, HashMap};

use crate::cache::types::{
    BatchId, Dna, MapValue, ObjectId, RequestId, SessionId,
};

/// One batched managed-object fetch. `depth` tells the server how much of
/// the surrounding graph to include; `parent_context` is a hint the server
/// may use for relative-depth optimization but is not obliged to honor.
/// Every request also drains the sender's removed-object accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRequest {
    pub request_id: RequestId,
    pub object_ids: BTreeSet<ObjectId>,
    pub depth: i32,
    pub parent_context: Option<ObjectId>,
    pub removed_ids: BTreeSet<ObjectId>,
}

/// Depth used for a request that only carries removed-object accounting.
pub const REMOVAL_ONLY_DEPTH: i32 = -1;

/// One GET_VALUE sub-request inside a coalesced server-map message.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRequest {
    pub request_id: RequestId,
    pub map_id: ObjectId,
    pub keys: BTreeSet<String>,
}

/// Outbound server-map traffic. Only GET_VALUE requests coalesce; size and
/// key enumeration have no useful batching opportunity and always go out
/// alone.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMapRequest {
    GetValue { requests: Vec<ValueRequest> },
    GetSize {
        request_id: RequestId,
        map_ids: Vec<ObjectId>,
    },
    GetAllKeys {
        request_id: RequestId,
        map_id: ObjectId,
    },
}

/// Outbound side of the remote-store contract.
///
/// All methods are fire-and-forget and are invoked while manager locks are
/// held: implementations must enqueue and return, never block.
pub trait RemoteStore: Send + Sync {
    fn request_managed_objects(&self, request: ObjectRequest);
    fn request_root(&self, name: &str);
    /// Sent on (re)connect; the server reconciles against the ids this
    /// client still holds.
    fn handshake(&self, local_ids: BTreeSet<ObjectId>);
    fn server_map_request(&self, request: ServerMapRequest);
}

/// Asynchronous responses and notifications from the remote store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Objects {
        session: SessionId,
        batch: BatchId,
        dnas: Vec<Dna>,
    },
    ObjectsNotFound {
        session: SessionId,
        missing: BTreeSet<ObjectId>,
    },
    Root {
        session: SessionId,
        name: String,
        object_id: ObjectId,
    },
    ServerMapValues {
        session: SessionId,
        map_id: ObjectId,
        request_id: RequestId,
        values: HashMap<String, MapValue>,
    },
    ServerMapSize {
        session: SessionId,
        request_id: RequestId,
        size: u64,
    },
    ServerMapKeys {
        session: SessionId,
        request_id: RequestId,
        keys: BTreeSet<String>,
    },
    ServerMapMissing {
        session: SessionId,
        request_id: RequestId,
        map_id: ObjectId,
    },
    /// Change broadcast invalidating eventual server-map entries.
    Invalidations {
        map_id: ObjectId,
        keys: Vec<String>,
    },
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every outbound message for assertion in tests.
    #[derive(Default)]
    pub struct RecordingStore {
        pub object_requests: Mutex<Vec<ObjectRequest>>,
        pub root_requests: Mutex<Vec<String>>,
        pub handshakes: Mutex<Vec<BTreeSet<ObjectId>>>,
        pub map_requests: Mutex<Vec<ServerMapRequest>>,
    }

    impl RecordingStore {
        pub fn new() -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self::default())
        }

        pub fn object_request_count(&self) -> usize {
            self.object_requests.lock().unwrap().len()
        }

        /// All object ids requested so far, with multiplicity.
        pub fn requested_ids(&self) -> Vec<ObjectId> {
            self.object_requests
                .lock()
                .unwrap()
                .iter()
                .flat_map(|r| r.object_ids.iter().copied())
                .collect()
        }
    }

    impl RemoteStore for RecordingStore {
        fn request_managed_objects(&self, request: ObjectRequest) {
            self.object_requests.lock().unwrap().push(request);
        }

        fn request_root(&self, name: &str) {
            self.root_requests.lock().unwrap().push(name.to_string());
        }

        fn handshake(&self, local_ids: BTreeSet<ObjectId>) {
            self.handshakes.lock().unwrap().push(local_ids);
        }

        fn server_map_request(&self, request: ServerMapRequest) {
            self.map_requests.lock().unwrap().push(request);
        }
    }
}
