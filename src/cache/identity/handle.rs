//! Managed-object handles and the peer seam.
//!
//! A [`ManagedHandle`] is the engine's bookkeeping peer for one application
//! object: it pins the object's identity and version while holding the
//! application value itself only weakly, so the value can be reclaimed
//! independently of the handle. The application side of the seam is the
//! [`ManagedPeer`] trait: an explicit managed wrapper that reports and
//! applies field state instead of relying on instrumentation magic.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::Sender;
use crossbeam_utils::CachePadded;
use log::debug;

use crate::cache::types::{Dna, FaultError, ObjectId};

/// Resolves a child reference during hydration, faulting it in if needed.
///
/// Implementations route back into the lookup coordinator carrying the
/// caller's lookup context, which is what lets a single logical operation
/// hydrate a whole object graph without deadlocking on itself.
pub trait ReferenceResolver {
    fn resolve(&self, id: ObjectId) -> Result<PeerRef, FaultError>;
}

/// Application-side managed wrapper for one shared object.
///
/// `clear_references` breaks up to `max` outgoing references (dropping the
/// `PeerRef`s it holds, which turns them back into unresolved ids) and
/// returns how many it actually cleared.
pub trait ManagedPeer: Send + Sync + 'static {
    fn hydrate(&self, dna: &Dna, resolver: &dyn ReferenceResolver) -> Result<(), FaultError>;
    fn clear_references(&self, max: usize) -> usize;
}

/// Factory materializing an empty peer for the type named in a DNA record.
///
/// Failure to resolve the type must be reported as
/// [`FaultError::TypeResolution`] so callers can tell it apart from
/// transport errors.
pub trait PeerFactory: Send + Sync {
    fn create_peer(&self, dna: &Dna) -> Result<Arc<dyn ManagedPeer>, FaultError>;
}

struct HandleFlags {
    is_new: AtomicBool,
    recently_accessed: AtomicBool,
    eviction_in_progress: AtomicBool,
    auto_locking_disabled: AtomicBool,
}

/// Engine-side peer of one application object.
pub struct ManagedHandle {
    object_id: ObjectId,
    version: AtomicI64,
    peer: Weak<dyn ManagedPeer>,
    /// Serializes version-gated DNA application and reference clearing per
    /// handle, so eviction never races a concurrent update of the same
    /// object's reference graph.
    apply_lock: Mutex<()>,
    flags: CachePadded<HandleFlags>,
}

impl ManagedHandle {
    pub fn new(
        object_id: ObjectId,
        peer: &Arc<dyn ManagedPeer>,
        version: i64,
        is_new: bool,
    ) -> Arc<Self> {
        Arc::new(ManagedHandle {
            object_id,
            version: AtomicI64::new(version),
            peer: Arc::downgrade(peer),
            apply_lock: Mutex::new(()),
            flags: CachePadded::new(HandleFlags {
                is_new: AtomicBool::new(is_new),
                recently_accessed: AtomicBool::new(true),
                eviction_in_progress: AtomicBool::new(false),
                auto_locking_disabled: AtomicBool::new(false),
            }),
        })
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Acquire)
    }

    /// Upgrade the weak peer reference; `None` once the application has
    /// dropped its last strong reference.
    pub fn peer(&self) -> Option<Arc<dyn ManagedPeer>> {
        self.peer.upgrade()
    }

    /// Apply a DNA update with stale-update rejection: versions at or below
    /// the current one are ignored unless `force` is set. Returns whether
    /// the update was applied.
    pub fn apply_dna(
        &self,
        dna: &Dna,
        force: bool,
        resolver: &dyn ReferenceResolver,
    ) -> Result<bool, FaultError> {
        let _guard = self.apply_lock.lock().expect("handle apply lock poisoned");
        let current = self.version.load(Ordering::Acquire);
        if !force && dna.version <= current {
            debug!(
                "ignoring stale update for {}: incoming v{} <= current v{}",
                self.object_id, dna.version, current
            );
            return Ok(false);
        }
        match self.peer.upgrade() {
            Some(peer) => {
                peer.hydrate(dna, resolver)?;
                self.version.store(dna.version, Ordering::Release);
                Ok(true)
            }
            None => {
                debug!(
                    "dropping update for {}: peer already unreachable",
                    self.object_id
                );
                Ok(false)
            }
        }
    }

    /// Break up to `max` outgoing references of the peer; returns how many
    /// were cleared. Serialized against concurrent DNA application.
    pub fn clear_references(&self, max: usize) -> usize {
        let _guard = self.apply_lock.lock().expect("handle apply lock poisoned");
        match self.peer.upgrade() {
            Some(peer) => peer.clear_references(max),
            None => 0,
        }
    }

    pub fn mark_accessed(&self) {
        self.flags.recently_accessed.store(true, Ordering::Relaxed);
    }

    /// Reads and clears the recently-accessed flag (second-chance sweep).
    pub fn take_recently_accessed(&self) -> bool {
        self.flags.recently_accessed.swap(false, Ordering::Relaxed)
    }

    pub fn is_new(&self) -> bool {
        self.flags.is_new.load(Ordering::Acquire)
    }

    /// Called once the creating transaction has committed; committed handles
    /// become eligible for eviction.
    pub fn mark_committed(&self) {
        self.flags.is_new.store(false, Ordering::Release);
    }

    /// Atomically claim this handle for eviction; returns false if another
    /// evictor already holds it.
    pub fn try_claim_eviction(&self) -> bool {
        self.flags
            .eviction_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_eviction(&self) {
        self.flags
            .eviction_in_progress
            .store(false, Ordering::Release);
    }

    pub fn is_eviction_in_progress(&self) -> bool {
        self.flags.eviction_in_progress.load(Ordering::Acquire)
    }

    pub fn set_auto_locking_disabled(&self, disabled: bool) {
        self.flags
            .auto_locking_disabled
            .store(disabled, Ordering::Release);
    }

    pub fn is_auto_locking_disabled(&self) -> bool {
        self.flags.auto_locking_disabled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ManagedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedHandle")
            .field("object_id", &self.object_id)
            .field("version", &self.version())
            .field("peer_alive", &self.peer.upgrade().is_some())
            .finish()
    }
}

/// Strong application reference to a faulted-in peer.
///
/// Dropping the last `PeerRef` (and any other strong peer references) makes
/// the object reclaimable; the drop hook feeds the id to the reaper, which
/// double-checks reachability before removing the identity entry.
pub struct PeerRef {
    /// `Some` until the drop hook runs; released there ahead of the reap
    /// notification so the reaper never observes this reference as alive.
    peer: Option<Arc<dyn ManagedPeer>>,
    handle: Arc<ManagedHandle>,
    reap_tx: Sender<ObjectId>,
}

impl PeerRef {
    pub(crate) fn new(
        peer: Arc<dyn ManagedPeer>,
        handle: Arc<ManagedHandle>,
        reap_tx: Sender<ObjectId>,
    ) -> Self {
        PeerRef {
            peer: Some(peer),
            handle,
            reap_tx,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.handle.object_id()
    }

    pub fn peer(&self) -> &Arc<dyn ManagedPeer> {
        self.peer.as_ref().expect("peer present until drop")
    }

    pub fn handle(&self) -> &Arc<ManagedHandle> {
        &self.handle
    }
}

impl Clone for PeerRef {
    fn clone(&self) -> Self {
        PeerRef {
            peer: Some(Arc::clone(self.peer())),
            handle: Arc::clone(&self.handle),
            reap_tx: self.reap_tx.clone(),
        }
    }
}

impl Drop for PeerRef {
    fn drop(&mut self) {
        // The strong peer reference must be gone before the notification is
        // sent: the notification is one-shot, and a reaper running inside
        // the gap would otherwise see the peer alive and keep the entry
        // forever. Harmless if other strong refs remain, the reaper
        // re-checks reachability before removing anything.
        let id = self.handle.object_id();
        self.peer = None;
        let _ = self.reap_tx.send(id);
    }
}

impl std::fmt::Debug for PeerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRef")
            .field("object_id", &self.object_id())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Minimal peer for unit tests: stores hydrated fields and child refs.
    pub struct TestPeer {
        pub fields: Mutex<Vec<(String, crate::cache::types::DnaValue)>>,
        pub children: Mutex<Vec<PeerRef>>,
    }

    impl TestPeer {
        pub fn empty() -> Arc<dyn ManagedPeer> {
            Arc::new(TestPeer {
                fields: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
            })
        }
    }

    impl ManagedPeer for TestPeer {
        fn hydrate(
            &self,
            dna: &Dna,
            resolver: &dyn ReferenceResolver,
        ) -> Result<(), FaultError> {
            let mut fields = self.fields.lock().unwrap();
            fields.clear();
            for field in &dna.fields {
                fields.push((field.name.clone(), field.value.clone()));
            }
            drop(fields);
            let mut children = self.children.lock().unwrap();
            children.clear();
            for id in dna.reference_ids() {
                children.push(resolver.resolve(id)?);
            }
            Ok(())
        }

        fn clear_references(&self, max: usize) -> usize {
            let mut children = self.children.lock().unwrap();
            let n = max.min(children.len());
            for _ in 0..n {
                children.pop();
            }
            n
        }
    }

    /// Resolver that refuses every reference; for leaf-only tests.
    pub struct NoRefsResolver;

    impl ReferenceResolver for NoRefsResolver {
        fn resolve(&self, id: ObjectId) -> Result<PeerRef, FaultError> {
            panic!("unexpected reference resolution for {}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{NoRefsResolver, TestPeer};
    use super::*;
    use crate::cache::types::DnaValue;

    fn leaf_dna(id: ObjectId, version: i64) -> Dna {
        Dna::new(id, version, "demo.Leaf").with_field("n", DnaValue::Int(version))
    }

    #[test]
    fn stale_update_is_ignored_and_newer_applies() {
        let id = ObjectId::new(0, 9);
        let peer = TestPeer::empty();
        let handle = ManagedHandle::new(id, &peer, 5, false);

        assert!(!handle.apply_dna(&leaf_dna(id, 5), false, &NoRefsResolver).unwrap());
        assert!(!handle.apply_dna(&leaf_dna(id, 3), false, &NoRefsResolver).unwrap());
        assert_eq!(handle.version(), 5);

        assert!(handle.apply_dna(&leaf_dna(id, 6), false, &NoRefsResolver).unwrap());
        assert_eq!(handle.version(), 6);
    }

    #[test]
    fn forced_update_overrides_version_check() {
        let id = ObjectId::new(0, 10);
        let peer = TestPeer::empty();
        let handle = ManagedHandle::new(id, &peer, 5, false);
        assert!(handle.apply_dna(&leaf_dna(id, 2), true, &NoRefsResolver).unwrap());
        assert_eq!(handle.version(), 2);
    }

    #[test]
    fn update_after_peer_dropped_is_a_noop() {
        let id = ObjectId::new(0, 11);
        let peer = TestPeer::empty();
        let handle = ManagedHandle::new(id, &peer, 1, false);
        drop(peer);
        assert!(!handle.apply_dna(&leaf_dna(id, 9), false, &NoRefsResolver).unwrap());
        assert!(handle.peer().is_none());
    }

    #[test]
    fn drop_releases_the_peer_before_notifying_the_reaper() {
        let id = ObjectId::new(0, 13);
        let peer = TestPeer::empty();
        let handle = ManagedHandle::new(id, &peer, 1, false);
        let (tx, rx) = crossbeam_channel::unbounded();
        let peer_ref = PeerRef::new(peer, Arc::clone(&handle), tx);

        // The channel send synchronizes with the receive, so if the drop
        // hook releases its peer reference first, the watcher can never see
        // the peer alive.
        let watcher = {
            let handle = Arc::clone(&handle);
            std::thread::spawn(move || {
                let reaped = rx.recv().unwrap();
                (reaped, handle.peer().is_some())
            })
        };
        drop(peer_ref);
        let (reaped, alive) = watcher.join().unwrap();
        assert_eq!(reaped, id);
        assert!(!alive);
    }

    #[test]
    fn eviction_claim_is_exclusive() {
        let peer = TestPeer::empty();
        let handle = ManagedHandle::new(ObjectId::new(0, 12), &peer, 1, false);
        assert!(handle.try_claim_eviction());
        assert!(!handle.try_claim_eviction());
        handle.finish_eviction();
        assert!(handle.try_claim_eviction());
    }
}
