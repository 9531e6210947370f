//! Capacity-driven eviction: the policy seam and the clock implementation.

pub mod clock;
pub mod policy;

pub use clock::ClockEvictionPolicy;
pub use policy::{EvictionPolicy, NoEvictionPolicy};
