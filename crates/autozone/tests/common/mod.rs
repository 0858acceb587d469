//! Shared helpers for the autozone integration tests

#![allow(dead_code)]

use autozone::defaults::SUBZONE_SIZE;
use autozone::{BlockLayout, CollectorHost, PublishedStacks, Zone, ZoneConfig};
use parking_lot::Mutex;
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

/// Host that records every hook invocation
#[derive(Default)]
pub struct RecordingHost {
    pub invalidated: Mutex<Vec<usize>>,
    pub freed: Mutex<Vec<usize>>,
    pub over_retained: Mutex<Vec<usize>>,
}

impl RecordingHost {
    pub fn invalidated(&self) -> Vec<usize> {
        sorted(self.invalidated.lock().clone())
    }

    pub fn freed(&self) -> Vec<usize> {
        sorted(self.freed.lock().clone())
    }

    pub fn over_retained(&self) -> Vec<usize> {
        sorted(self.over_retained.lock().clone())
    }
}

impl CollectorHost for RecordingHost {
    fn invalidate_garbage(&self, garbage: &[usize]) {
        self.invalidated.lock().extend_from_slice(garbage);
    }

    fn free_garbage(&self, garbage: &[usize]) {
        self.freed.lock().extend_from_slice(garbage);
    }

    fn over_retained(&self, block: usize) {
        self.over_retained.lock().push(block);
    }
}

static TRACING: Once = Once::new();

/// Route collector logs to the test writer, filtered by `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

/// Small manually dispatched configuration
pub fn manual_config() -> ZoneConfig {
    ZoneConfig::manual().with_region_size(8 * SUBZONE_SIZE)
}

/// Manually dispatched zone with the default host
pub fn manual_zone() -> Arc<Zone> {
    init_tracing();
    Zone::new(manual_config()).unwrap()
}

/// Zone reporting to a recording host
pub fn recording_zone(config: ZoneConfig) -> (Arc<Zone>, Arc<RecordingHost>) {
    init_tracing();
    let host = Arc::new(RecordingHost::default());
    let zone = Zone::with_host(config, host.clone(), Arc::new(PublishedStacks)).unwrap();
    (zone, host)
}

/// Allocate a zeroed scanned block
pub fn scanned(zone: &Zone, size: usize) -> usize {
    zone.allocate(size, BlockLayout::SCANNED, true, false).unwrap()
}

pub fn sorted(mut values: Vec<usize>) -> Vec<usize> {
    values.sort_unstable();
    values
}

/// Address of a word cell owned by the test
pub fn cell_address(cell: &usize) -> usize {
    cell as *const usize as usize
}
