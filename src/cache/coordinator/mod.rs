//! Lookup coordination: per-caller context, per-id gates, and the manager
//! that ties them to the identity map and fetch pipeline.

pub(crate) mod lookup_context;
pub(crate) mod lookup_state;
pub mod object_manager;

pub use object_manager::{
    ClientObjectManager, LocalObjectIdProvider, NoopTransactionObserver, ObjectIdProvider,
    TransactionObserver,
};
