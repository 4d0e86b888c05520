#![forbid(unsafe_code)]

//! Scan statistics kept per list and per PLC.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Per-scan-list timing and error counters. Mutated by the worker while it
/// holds the PLC lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStats {
    pub errors: u64,
    pub last: Option<Duration>,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    pub last_scan: Option<Instant>,
}

impl ScanStats {
    pub(crate) fn record(&mut self, took: Duration, at: Instant) {
        self.last = Some(took);
        self.min = Some(self.min.map_or(took, |m| m.min(took)));
        self.max = Some(self.max.map_or(took, |m| m.max(took)));
        self.last_scan = Some(at);
    }

    pub(crate) fn record_error(&mut self) {
        self.errors += 1;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Counter for cycles that missed their schedule. Incremented without the
/// PLC lock, so it is an atomic.
#[derive(Debug, Default)]
pub struct SlowScanCounter(AtomicU64);

impl SlowScanCounter {
    pub(crate) fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}
