//! Remote-store integration: message contracts, session tracking, and the
//! outbound fetch pipeline.

pub mod messages;
pub(crate) mod batch_lru;
pub(crate) mod pipeline;
pub(crate) mod session;

pub use messages::{ObjectRequest, RemoteStore, ServerMapRequest, StoreEvent, ValueRequest};
pub use session::SessionManager;
