//! Engine configuration with production defaults.
//!
//! Plain-old-data structs with serde derives; defaults mirror the tunables
//! the engine was operated with in production deployments. All durations are
//! carried in milliseconds to keep the serialized form flat.

use serde::{Deserialize, Serialize};

use crate::cache::types::FaultError;

/// Top-level configuration for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultlineConfig {
    /// Group/partition this client talks to; lookups for a different group
    /// are a fatal coordination bug.
    pub group: u8,
    /// Default graph depth requested with each fault-in.
    pub default_fetch_depth: u32,
    pub fetch: FetchConfig,
    pub eviction: EvictionConfig,
    pub server_map: ServerMapConfig,
}

/// Tunables for the remote fetch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Requests at or below this many outstanding lookups are sent
    /// immediately; above it they are marked pending and flushed in batch.
    pub max_outstanding_sent_immediately: usize,
    /// One-shot delay before pending lookups are flushed, in ms.
    pub batch_lookup_flush_ms: u64,
    /// Removed-set size at which a flush is scheduled immediately.
    pub removed_objects_threshold: usize,
    /// Periodic removed-set flush delay, in ms.
    pub removed_objects_flush_ms: u64,
    /// Maximum number of unconsumed result batches retained in the LRU.
    pub max_dna_batches: usize,
    /// Period of the sweep that drops result batches untouched for two
    /// consecutive cycles, in ms.
    pub unused_batch_sweep_ms: u64,
    /// Bounded re-check interval while waiting for a fetch result, in ms.
    /// Used to observe lifecycle transitions and log long waits, not as a
    /// deadline.
    pub retrieve_poll_ms: u64,
    /// Bounded re-check interval while waiting on a concurrent lookup of the
    /// same id, in ms.
    pub concurrent_lookup_poll_ms: u64,
}

/// Tunables for capacity-driven eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Candidates are processed in batches of this size to bound how much
    /// work happens under a single exclusion window.
    pub commit_size: usize,
}

/// Tunables for the server-map managers and their local caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMapConfig {
    pub max_outstanding_sent_immediately: usize,
    pub batch_lookup_flush_ms: u64,
    /// Bounded re-check interval while waiting for a server-map result, in ms.
    pub result_poll_ms: u64,
    /// Incoherent cache entries older than this are recycled on read, in ms.
    pub incoherent_read_timeout_ms: u64,
}

impl Default for FaultlineConfig {
    fn default() -> Self {
        FaultlineConfig {
            group: 0,
            default_fetch_depth: 500,
            fetch: FetchConfig::default(),
            eviction: EvictionConfig::default(),
            server_map: ServerMapConfig::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            max_outstanding_sent_immediately: 32,
            batch_lookup_flush_ms: 10,
            removed_objects_threshold: 10_000,
            removed_objects_flush_ms: 5_000,
            max_dna_batches: 60,
            unused_batch_sweep_ms: 300_000,
            retrieve_poll_ms: 15_000,
            concurrent_lookup_poll_ms: 1_000,
        }
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        EvictionConfig { commit_size: 100 }
    }
}

impl Default for ServerMapConfig {
    fn default() -> Self {
        ServerMapConfig {
            max_outstanding_sent_immediately: 32,
            batch_lookup_flush_ms: 10,
            result_poll_ms: 30_000,
            incoherent_read_timeout_ms: 300_000,
        }
    }
}

impl FaultlineConfig {
    /// Reject configurations that would wedge the engine.
    pub fn validate(&self) -> Result<(), FaultError> {
        if self.fetch.max_dna_batches == 0 {
            return Err(FaultError::invalid_state(
                "fetch.max_dna_batches must be at least 1",
            ));
        }
        if self.fetch.retrieve_poll_ms == 0 || self.fetch.concurrent_lookup_poll_ms == 0 {
            return Err(FaultError::invalid_state(
                "poll intervals must be non-zero",
            ));
        }
        if self.eviction.commit_size == 0 {
            return Err(FaultError::invalid_state(
                "eviction.commit_size must be at least 1",
            ));
        }
        if self.server_map.result_poll_ms == 0 {
            return Err(FaultError::invalid_state(
                "server_map.result_poll_ms must be non-zero",
            ));
        }
        Ok(())
    }
}
