//! Default constants for zone configuration.
//!
//! Centralizes the geometry of the heap and the tunables of the collection
//! heuristics so that the allocator, the collectors, and `ZoneConfig` agree.

/// log2 of the subzone size.
pub const SUBZONE_SHIFT: usize = 20;

/// Size of one subzone in bytes (1 MiB).
pub const SUBZONE_SIZE: usize = 1 << SUBZONE_SHIFT;

/// log2 of the small quantum (16 bytes).
pub const SMALL_QUANTUM_SHIFT: usize = 4;

/// log2 of the medium quantum (256 bytes).
pub const MEDIUM_QUANTUM_SHIFT: usize = 8;

/// Requests below this many bytes are served by the small admins.
pub const SMALL_SIZE_LIMIT: usize = 1024;

/// Requests at or above this many bytes bypass the subzones entirely.
pub const LARGE_SIZE_THRESHOLD: usize = 128 * 1024;

/// Page granularity used for purging and large allocations.
pub const PAGE_SIZE: usize = 4096;

/// log2 of the card size used by the generational write barrier.
pub const CARD_SHIFT: usize = 7;

/// Number of exact-size free lists per admin. Larger entries share the last list.
pub const FREE_LIST_COUNT: usize = 64;

/// Default address space reserved for subzones (64 MiB).
pub const DEFAULT_REGION_SIZE: usize = 64 * 1024 * 1024;

/// Default bytes allocated between heuristic ratio collections (1 MiB).
pub const DEFAULT_COLLECTION_THRESHOLD: usize = 1024 * 1024;

/// Every Nth ratio collection is a full collection.
pub const DEFAULT_FULL_VS_GEN_FREQUENCY: u32 = 10;

/// Maximum full collections performed by one exhaustive request.
pub const DEFAULT_EXHAUSTIVE_COLLECTION_LIMIT: u32 = 8;

/// Per-thread limit on thread-local blocks before a local collection is forced.
pub const DEFAULT_LOCAL_ALLOCATIONS_SIZE_LIMIT: usize = 2000;

/// Maximum cached free blocks per (admin, size) pair in a thread's private cache.
pub const DEFAULT_THREAD_CACHE_LIMIT: usize = 32;

/// Interval at which the collector thread checks suspended mutators.
pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 1000;

/// Age given to a freshly allocated block. Age 0 means old.
pub const AGE_NEW: u8 = 3;

/// Smallest allocated size of the weak reference table.
pub const WEAK_TABLE_MIN_SIZE: usize = 15;

/// Referrer arrays at or above this size grow by doubling.
pub const REFERRERS_DOUBLING_THRESHOLD: usize = 8;

/// Upper bound on coalesced requests queued for one collection mode.
pub const MAX_PENDING_COLLECTIONS: u8 = u8::MAX;

/// Rounds of concurrent enlivening drain before the final locked drain.
pub const ENLIVENING_DRAIN_ROUNDS: usize = 8;
