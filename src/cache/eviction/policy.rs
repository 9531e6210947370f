//! Swappable candidate-selection policy for capacity eviction.

use std::sync::Arc;

use crate::cache::identity::ManagedHandle;
use crate::cache::types::ObjectId;

/// Selects which handles should give up references when memory is tight.
///
/// Policies track membership passively through the add/remove notifications
/// and must never select handles that are still new (uncommitted) or already
/// claimed by another evictor; the engine re-checks both, but a policy that
/// keeps offering them just wastes cycles.
pub trait EvictionPolicy: Send + Sync {
    /// A freshly hydrated handle entered the identity map.
    fn notify_added(&self, handle: &Arc<ManagedHandle>);

    /// The identity entry for `id` is gone; stop tracking it.
    fn notify_removed(&self, id: ObjectId);

    /// Up to `max` eviction candidates, best candidates first. May return
    /// fewer (including none) when the population cannot supply them.
    fn removal_candidates(&self, max: usize) -> Vec<Arc<ManagedHandle>>;
}

/// Policy that never selects anything; for engines with eviction disabled.
pub struct NoEvictionPolicy;

impl EvictionPolicy for NoEvictionPolicy {
    fn notify_added(&self, _handle: &Arc<ManagedHandle>) {}

    fn notify_removed(&self, _id: ObjectId) {}

    fn removal_candidates(&self, _max: usize) -> Vec<Arc<ManagedHandle>> {
        Vec::new()
    }
}
