//! Connection-generation tracking.
//!
//! Every asynchronous response carries the session it was produced under; a
//! response from an older session raced a reconnect and must be discarded,
//! not applied. Sessions only ever move forward.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::types::SessionId;

#[derive(Debug, Default)]
pub struct SessionManager {
    current: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            current: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> SessionId {
        SessionId(self.current.load(Ordering::Acquire))
    }

    /// Advance to a new session; called when the connection is torn down.
    pub fn new_session(&self) -> SessionId {
        SessionId(self.current.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub fn is_current(&self, session: SessionId) -> bool {
        session.0 == self.current.load(Ordering::Acquire)
    }
}
