//! Object identity: handles, the id-to-handle map, and peer reclamation.

pub mod handle;
pub(crate) mod map;
pub(crate) mod reaper;

pub use handle::{ManagedHandle, ManagedPeer, PeerFactory, PeerRef, ReferenceResolver};
