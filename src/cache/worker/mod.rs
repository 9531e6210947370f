//! Background worker plumbing.

pub mod scheduler;

pub use scheduler::TaskTimer;
