//! Error taxonomy for fault-in and server-map operations.
//!
//! Typed failures a caller can act on get their own variants (`ObjectNotFound`
//! and `TypeResolution` must be distinguishable from transport trouble).
//! Coordination bugs such as double registration, wrong-group lookups, and
//! wrong-context removals are *not* represented here: those panic, because
//! they indicate a broken invariant rather than a condition the caller can
//! recover from.

use std::fmt;

use crate::cache::types::object_id::ObjectId;

/// Failure modes surfaced to callers of the fault-in engine.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultError {
    /// The remote store confirmed the id does not exist.
    ObjectNotFound(ObjectId),
    /// The remote store confirmed the server-map does not exist.
    MapNotFound(ObjectId),
    /// The local runtime cannot materialize the type named in a DNA record.
    TypeResolution(String),
    /// The transport failed to carry a request.
    Transport(String),
    /// Operation attempted against a manager in the wrong lifecycle state.
    InvalidState(String),
    /// The engine is stopped; no further requests will be serviced.
    ShuttingDown,
    /// A fetch or hydration failed for a reason other than the typed cases.
    Lookup(String),
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::ObjectNotFound(id) => {
                write!(f, "Object not found in remote store: {}", id)
            }
            FaultError::MapNotFound(id) => {
                write!(f, "Server map not found in remote store: {}", id)
            }
            FaultError::TypeResolution(msg) => {
                write!(f, "Cannot resolve peer type: {}", msg)
            }
            FaultError::Transport(msg) => write!(f, "Transport failure: {}", msg),
            FaultError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            FaultError::ShuttingDown => write!(f, "Engine is shutting down"),
            FaultError::Lookup(msg) => write!(f, "Lookup failed: {}", msg),
        }
    }
}

impl std::error::Error for FaultError {}

impl FaultError {
    /// Create a type-resolution error.
    #[inline]
    pub fn type_resolution(msg: impl Into<String>) -> Self {
        Self::TypeResolution(msg.into())
    }

    /// Create a transport error.
    #[inline]
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an invalid-state error.
    #[inline]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a generic lookup failure.
    #[inline]
    pub fn lookup_failed(msg: impl Into<String>) -> Self {
        Self::Lookup(msg.into())
    }

    /// True for the typed failures that pass through wrapping untouched so
    /// callers can match on them.
    pub fn is_typed(&self) -> bool {
        matches!(
            self,
            FaultError::ObjectNotFound(_)
                | FaultError::MapNotFound(_)
                | FaultError::TypeResolution(_)
                | FaultError::ShuttingDown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_errors_are_distinguishable() {
        let nf = FaultError::ObjectNotFound(ObjectId::new(0, 7));
        let tr = FaultError::type_resolution("demo.Widget");
        assert!(nf.is_typed());
        assert!(tr.is_typed());
        assert!(!FaultError::transport("eof").is_typed());
        assert_ne!(nf, tr);
    }
}
