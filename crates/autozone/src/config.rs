//! Zone configuration

use crate::defaults::*;
use serde::{Deserialize, Serialize};

/// How background collection work is dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// A dedicated collector thread drains the work queue.
    #[default]
    Background,

    /// Work stays queued until the embedder calls `Zone::drain_tasks`.
    Manual,
}

/// Tunables for one zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    /// Bytes of address space reserved for subzones
    pub region_size: usize,

    /// Bytes allocated between heuristic ratio collections
    pub collection_threshold: usize,

    /// Every Nth ratio collection is full instead of generational
    pub full_vs_gen_frequency: u32,

    /// Upper bound on full collections run by one exhaustive request
    pub exhaustive_collection_limit: u32,

    /// Per-thread thread-local block limit
    pub local_allocations_size_limit: usize,

    /// Whether registered threads allocate thread-local blocks
    pub thread_local_collection: bool,

    /// Whether ratio collections may be generational
    pub generational: bool,

    /// Cached free blocks per (admin, size) pair in each thread
    pub thread_cache_limit: usize,

    /// Background work dispatch
    pub dispatch: Dispatch,

    /// Suspended-thread watchdog interval
    pub watchdog_interval_ms: u64,

    /// Zero memory when blocks are freed
    pub scribble_on_free: bool,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            region_size: DEFAULT_REGION_SIZE,
            collection_threshold: DEFAULT_COLLECTION_THRESHOLD,
            full_vs_gen_frequency: DEFAULT_FULL_VS_GEN_FREQUENCY,
            exhaustive_collection_limit: DEFAULT_EXHAUSTIVE_COLLECTION_LIMIT,
            local_allocations_size_limit: DEFAULT_LOCAL_ALLOCATIONS_SIZE_LIMIT,
            thread_local_collection: true,
            generational: true,
            thread_cache_limit: DEFAULT_THREAD_CACHE_LIMIT,
            dispatch: Dispatch::Background,
            watchdog_interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
            scribble_on_free: true,
        }
    }
}

impl ZoneConfig {
    /// Configuration for embedders that drive background work themselves.
    pub fn manual() -> Self {
        Self {
            dispatch: Dispatch::Manual,
            ..Self::default()
        }
    }

    /// Default configuration overlaid with `AUTOZONE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Overlay `AUTOZONE_*` environment variables onto this configuration.
    pub fn with_env(mut self) -> Self {
        if env_flag("AUTOZONE_DISABLE_TLC") {
            self.thread_local_collection = false;
        }
        if env_flag("AUTOZONE_DISABLE_GENERATIONAL") {
            self.generational = false;
        }
        if let Some(threshold) = env_number("AUTOZONE_COLLECTION_THRESHOLD") {
            self.collection_threshold = threshold;
        }
        if let Some(limit) = env_number("AUTOZONE_LOCAL_LIMIT") {
            self.local_allocations_size_limit = limit;
        }
        self
    }

    /// Set the reserved region size
    pub fn with_region_size(mut self, bytes: usize) -> Self {
        self.region_size = bytes;
        self
    }

    /// Set the ratio collection threshold
    pub fn with_collection_threshold(mut self, bytes: usize) -> Self {
        self.collection_threshold = bytes;
        self
    }

    /// Set the per-thread local block limit
    pub fn with_local_limit(mut self, blocks: usize) -> Self {
        self.local_allocations_size_limit = blocks;
        self
    }

    /// Set the dispatch mode
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("YES") | Some("yes")
    )
}

fn env_number(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
