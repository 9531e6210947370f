//! Faultline prelude - convenient imports for embedders
//!
//! Everything needed to wire the engine into a runtime: the builder, the
//! transport and peer contracts, and the wire vocabulary.

// Re-export the public API
pub use crate::faultline::{Faultline, FaultlineBuilder};

// Configuration
pub use crate::cache::config::{EvictionConfig, FaultlineConfig, FetchConfig, ServerMapConfig};

// Error type returned by every fallible operation
pub use crate::cache::types::FaultError;

// Wire vocabulary the transport speaks
pub use crate::cache::remote::{
    ObjectRequest, RemoteStore, ServerMapRequest, StoreEvent, ValueRequest,
};
pub use crate::cache::types::{
    BatchId, Dna, DnaValue, LockId, MapValue, ObjectId, RequestId, RunState, SessionId,
};

// Contracts embedders implement
pub use crate::cache::coordinator::{
    LocalObjectIdProvider, NoopTransactionObserver, ObjectIdProvider, TransactionObserver,
};
pub use crate::cache::eviction::{ClockEvictionPolicy, EvictionPolicy, NoEvictionPolicy};
pub use crate::cache::identity::{ManagedPeer, PeerFactory, PeerRef, ReferenceResolver};

// Server-map handles
pub use crate::cache::servermap::ServerMap;
