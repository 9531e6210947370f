//! Core engine modules.
//!
//! `coordinator` owns the lookup path, `remote` the fetch pipeline and
//! transport contract, `identity` the handle layer, `servermap` the
//! key/value side, `eviction` the removal policy, and `worker` the shared
//! timer. `types` and `config` hold the vocabulary everything else speaks.

pub mod config;
pub mod coordinator;
pub mod eviction;
pub mod identity;
pub mod remote;
pub mod servermap;
pub mod types;
pub mod worker;
