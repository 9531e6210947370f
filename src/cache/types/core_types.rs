//! Small identifier newtypes and shared enums used across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

id_newtype!(
    /// Identifier of a single outbound fetch request.
    RequestId
);
id_newtype!(
    /// Identifier of one batch of fetch results as grouped by the server.
    BatchId
);
id_newtype!(
    /// Connection generation counter; stale responses carry an old session.
    SessionId
);
id_newtype!(
    /// Identifier of a cluster lock protecting a strong server-map read.
    LockId
);

/// Lifecycle of a manager instance.
///
/// `Paused` discards all unconsumed fetch state (the handshake re-announces
/// everything this client still holds); `Starting` is the transient handshake
/// phase between `Paused` and `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Starting,
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::Starting => "STARTING",
            RunState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}
