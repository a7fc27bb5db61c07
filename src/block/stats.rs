// ============================================================================
// src/block/stats.rs - Per-Device I/O Statistics
// ============================================================================
//! Per-device counters for operational tooling.
//!
//! Counters are advisory, not authoritative for correctness: they are
//! updated with relaxed atomics outside the engine lock.

use core::sync::atomic::{AtomicU64, Ordering};

/// Per-device I/O counters
#[derive(Debug, Default)]
pub struct DeviceStats {
    reads_completed: AtomicU64,
    writes_completed: AtomicU64,
    blocks_read: AtomicU64,
    blocks_written: AtomicU64,
    flushes: AtomicU64,
    trims: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub reads_completed: u64,
    pub writes_completed: u64,
    pub blocks_read: u64,
    pub blocks_written: u64,
    pub flushes: u64,
    pub trims: u64,
    pub errors: u64,
}

impl DeviceStats {
    pub const fn new() -> Self {
        Self {
            reads_completed: AtomicU64::new(0),
            writes_completed: AtomicU64::new(0),
            blocks_read: AtomicU64::new(0),
            blocks_written: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            trims: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn record_read(&self, blocks: u32) {
        self.reads_completed.fetch_add(1, Ordering::Relaxed);
        self.blocks_read.fetch_add(blocks as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, blocks: u32) {
        self.writes_completed.fetch_add(1, Ordering::Relaxed);
        self.blocks_written.fetch_add(blocks as u64, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trim(&self) {
        self.trims.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads_completed: self.reads_completed.load(Ordering::Relaxed),
            writes_completed: self.writes_completed.load(Ordering::Relaxed),
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            trims: self.trims.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = DeviceStats::new();
        stats.record_write(4);
        stats.record_read(8);
        stats.record_read(8);
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!(snap.writes_completed, 1);
        assert_eq!(snap.blocks_written, 4);
        assert_eq!(snap.reads_completed, 2);
        assert_eq!(snap.blocks_read, 16);
        assert_eq!(snap.errors, 1);
    }
}
