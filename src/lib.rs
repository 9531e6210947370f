//! Faultline - client-side fault-in cache for distributed shared objects
//!
//! A local engine that materializes remote managed objects on demand,
//! deduplicates concurrent fetches, batches traffic to the store, and keeps
//! the local working set bounded.
//!
//! # Features
//!
//! - **Identity map**: one handle per object id, shared by every caller
//! - **Fault-in pipeline**: batched, depth-grouped fetches with prefetch parking
//! - **Reentrant lookups**: graph hydration resolves references through the same path
//! - **Roots**: named entry points with exactly-once creation
//! - **Server maps**: key/value access to large collections with three durability modes
//! - **Clock eviction**: second-chance removal measured in references cleared
//! - **Reconnect lifecycle**: pause, handshake, unpause with session fencing

// Public API modules
pub mod faultline;
pub mod prelude;

// Engine implementation modules - traits are public for embedder implementations
pub mod cache;

// Re-export the public API at the crate root for convenience
pub use faultline::{Faultline, FaultlineBuilder};
pub use prelude::*;

// Public traits and types embedders need to implement
pub mod traits {
    pub use crate::cache::coordinator::{ObjectIdProvider, TransactionObserver};
    pub use crate::cache::eviction::EvictionPolicy;
    pub use crate::cache::identity::{ManagedPeer, PeerFactory, ReferenceResolver};
    pub use crate::cache::remote::RemoteStore;
}
