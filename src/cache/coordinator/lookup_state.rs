//! Per-id lookup gate.
//!
//! One gate exists per object id while a fetch/create is outstanding; it is
//! the sole arbiter of "this id is currently being resolved." The gate is
//! shared by Arc so a waiter that grabbed it before a failure can still
//! observe the terminal phase after the owner removed the gate from the
//! coordinator's table.

use std::sync::{Arc, Mutex};

use crate::cache::coordinator::lookup_context::OperationLatch;
use crate::cache::identity::ManagedHandle;
use crate::cache::types::FaultError;

/// Phase of an in-flight resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GatePhase {
    /// Fetch outstanding; no handle exists yet.
    Lookup,
    /// Handle created, hydration in progress. Waiters may take the
    /// partially-hydrated handle if they record a dependency on the creator.
    Create,
    /// Handle registered in the identity map; gate is being retired.
    Resolved,
    /// Resolution failed; waiters get the error instead of hanging.
    Failed,
}

struct GateInner {
    phase: GatePhase,
    handle: Option<Arc<ManagedHandle>>,
    error: Option<FaultError>,
}

pub(crate) struct LookupGate {
    inner: Mutex<GateInner>,
    creator_latch: Arc<OperationLatch>,
}

impl LookupGate {
    pub fn new(creator_latch: Arc<OperationLatch>) -> Arc<Self> {
        Arc::new(LookupGate {
            inner: Mutex::new(GateInner {
                phase: GatePhase::Lookup,
                handle: None,
                error: None,
            }),
            creator_latch,
        })
    }

    pub fn phase(&self) -> GatePhase {
        self.inner.lock().expect("gate lock poisoned").phase
    }

    /// Latch of the operation that owns this resolution.
    pub fn creator_latch(&self) -> &Arc<OperationLatch> {
        &self.creator_latch
    }

    pub fn handle(&self) -> Option<Arc<ManagedHandle>> {
        self.inner.lock().expect("gate lock poisoned").handle.clone()
    }

    pub fn error(&self) -> Option<FaultError> {
        self.inner.lock().expect("gate lock poisoned").error.clone()
    }

    pub fn set_create(&self, handle: Arc<ManagedHandle>) {
        let mut inner = self.inner.lock().expect("gate lock poisoned");
        debug_assert_eq!(inner.phase, GatePhase::Lookup);
        inner.phase = GatePhase::Create;
        inner.handle = Some(handle);
    }

    pub fn set_resolved(&self) {
        let mut inner = self.inner.lock().expect("gate lock poisoned");
        inner.phase = GatePhase::Resolved;
    }

    pub fn set_failed(&self, error: FaultError) {
        let mut inner = self.inner.lock().expect("gate lock poisoned");
        inner.phase = GatePhase::Failed;
        inner.handle = None;
        inner.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::identity::handle::test_support::TestPeer;
    use crate::cache::types::ObjectId;

    #[test]
    fn phases_progress_to_resolved() {
        let gate = LookupGate::new(OperationLatch::new());
        assert_eq!(gate.phase(), GatePhase::Lookup);
        assert!(gate.handle().is_none());

        let peer = TestPeer::empty();
        gate.set_create(ManagedHandle::new(ObjectId::new(0, 1), &peer, 1, false));
        assert_eq!(gate.phase(), GatePhase::Create);
        assert!(gate.handle().is_some());

        gate.set_resolved();
        assert_eq!(gate.phase(), GatePhase::Resolved);
    }

    #[test]
    fn failure_clears_handle_and_carries_error() {
        let gate = LookupGate::new(OperationLatch::new());
        let peer = TestPeer::empty();
        gate.set_create(ManagedHandle::new(ObjectId::new(0, 2), &peer, 1, false));
        gate.set_failed(FaultError::transport("connection reset"));
        assert_eq!(gate.phase(), GatePhase::Failed);
        assert!(gate.handle().is_none());
        assert!(matches!(gate.error(), Some(FaultError::Transport(_))));
    }
}
