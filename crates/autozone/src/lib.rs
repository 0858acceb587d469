//! Autozone: a concurrent, partially generational tracing collector
//!
//! This crate provides a malloc-compatible allocation zone whose blocks are
//! reclaimed automatically:
//! - Thread-local collection of blocks owned by a single mutator
//! - Background global collection (ratio, generational, full, exhaustive)
//! - Weak references that are nulled when their referent is collected
//! - An enlivening write barrier that keeps concurrent scans sound
//! - Scoped lock primitives shared by all of the above

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod defaults;
pub mod heap;
pub mod host;
pub mod pointer_hash;
pub mod probe;
pub mod sync;
pub mod thread;
pub mod tlc;
pub mod weak;
pub mod zone;

pub use config::{Dispatch, ZoneConfig};
pub use heap::{BlockFlags, BlockLayout};
pub use host::{CollectorHost, DefaultHost, PublishedStacks, StackEnumerator, WordRange};
pub use thread::Thread;
pub use tlc::{FinalizeMode, TlcOutcome};
pub use weak::WeakCallback;
pub use zone::{CollectOptions, CollectSummary, CollectionState, GlobalMode, Zone, ZoneStats};

/// Zone errors
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    /// The backing memory cannot satisfy the request
    #[error("Zone exhausted allocating {size} bytes")]
    Exhausted {
        /// Requested size
        size: usize,
    },

    /// Thread-scoped operation from a thread the zone does not know
    #[error("Thread not registered with the zone")]
    NotRegistered,

    /// Thread registered twice
    #[error("Thread already registered with the zone")]
    AlreadyRegistered,

    /// Address is not the start of an allocated block
    #[error("Not a block: {0:#x}")]
    NotABlock(usize),

    /// A collection is already running on this thread
    #[error("Collection already in progress")]
    CollectionInProgress,

    /// Size cannot be represented
    #[error("Invalid allocation size")]
    InvalidSize,

    /// The collector thread could not be started
    #[error("Failed to spawn collector thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

/// Zone result
pub type ZoneResult<T> = Result<T, ZoneError>;
