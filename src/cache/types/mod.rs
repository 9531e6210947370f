//! Core value types for the fault-in engine.

pub mod core_types;
pub mod dna;
pub mod error_types;
pub mod object_id;

pub use core_types::{BatchId, LockId, RequestId, RunState, SessionId};
pub use dna::{Dna, DnaField, DnaValue, MapValue};
pub use error_types::FaultError;
pub use object_id::ObjectId;
