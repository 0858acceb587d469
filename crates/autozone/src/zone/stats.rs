//! Collection statistics

use super::GlobalMode;
use serde::Serialize;
use std::time::Duration;

/// Zone statistics
#[derive(Debug, Clone, Serialize)]
pub struct ZoneStats {
    /// Total number of global collections
    pub collections: usize,

    /// Global collections per mode: ratio, generational, full, exhaustive
    pub collections_by_mode: [usize; 4],

    /// Total blocks freed by global collections
    pub objects_freed: usize,

    /// Total bytes freed by global collections
    pub bytes_freed: usize,

    /// Total pause time across all global collections
    pub total_pause_time: Duration,

    /// Last global collection duration
    pub last_pause_time: Duration,

    /// Average pause time
    pub avg_pause_time: Duration,

    /// Maximum pause time
    pub max_pause_time: Duration,

    /// Minimum pause time
    pub min_pause_time: Duration,

    /// Blocks marked in last global collection
    pub last_marked_count: usize,

    /// Blocks freed in last global collection
    pub last_freed_count: usize,

    /// Bytes freed in last global collection
    pub last_freed_bytes: usize,

    /// Live blocks after last global collection
    pub live_objects: usize,

    /// Live bytes after last global collection
    pub live_bytes: usize,

    /// Thread-local collections run
    pub local_collections: usize,

    /// Blocks found garbage by thread-local collections
    pub local_garbage: usize,

    /// Thread-local garbage returned to thread caches
    pub local_scavenged: usize,

    /// Total thread-local collection time
    pub local_time: Duration,

    /// Weak slots nulled
    pub weak_cleared: usize,

    /// Resurrections caught by the write barrier
    pub resurrections: usize,
}

impl Default for ZoneStats {
    fn default() -> Self {
        Self {
            collections: 0,
            collections_by_mode: [0; 4],
            objects_freed: 0,
            bytes_freed: 0,
            total_pause_time: Duration::ZERO,
            last_pause_time: Duration::ZERO,
            avg_pause_time: Duration::ZERO,
            max_pause_time: Duration::ZERO,
            min_pause_time: Duration::ZERO,
            last_marked_count: 0,
            last_freed_count: 0,
            last_freed_bytes: 0,
            live_objects: 0,
            live_bytes: 0,
            local_collections: 0,
            local_garbage: 0,
            local_scavenged: 0,
            local_time: Duration::ZERO,
            weak_cleared: 0,
            resurrections: 0,
        }
    }
}

/// Figures from one global collection pass
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PassReport {
    pub pause: Duration,
    pub marked: usize,
    pub freed: usize,
    pub freed_bytes: usize,
    pub live_objects: usize,
    pub live_bytes: usize,
    pub weak_cleared: usize,
}

impl ZoneStats {
    /// Update statistics after a global collection
    pub(crate) fn update(&mut self, mode: GlobalMode, report: PassReport) {
        self.collections += 1;
        self.collections_by_mode[mode.index()] += 1;
        self.objects_freed += report.freed;
        self.bytes_freed += report.freed_bytes;
        self.total_pause_time += report.pause;
        self.last_pause_time = report.pause;

        self.avg_pause_time = self.total_pause_time / self.collections as u32;

        if report.pause > self.max_pause_time {
            self.max_pause_time = report.pause;
        }
        if self.collections == 1 || report.pause < self.min_pause_time {
            self.min_pause_time = report.pause;
        }

        self.last_marked_count = report.marked;
        self.last_freed_count = report.freed;
        self.last_freed_bytes = report.freed_bytes;
        self.live_objects = report.live_objects;
        self.live_bytes = report.live_bytes;
        self.weak_cleared += report.weak_cleared;
    }

    /// Record a thread-local collection
    pub(crate) fn update_local(&mut self, garbage: usize, scavenged: usize, elapsed: Duration) {
        self.local_collections += 1;
        self.local_garbage += garbage;
        self.local_scavenged += scavenged;
        self.local_time += elapsed;
    }

    /// Global collections run in `mode`
    pub fn collections_in(&self, mode: GlobalMode) -> usize {
        self.collections_by_mode[mode.index()]
    }

    /// Get survival rate (0.0 to 1.0)
    pub fn survival_rate(&self) -> f64 {
        let seen = self.last_marked_count + self.last_freed_count;
        if seen == 0 {
            return 0.0;
        }
        self.last_marked_count as f64 / seen as f64
    }
}
